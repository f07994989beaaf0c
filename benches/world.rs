#[macro_use]
extern crate criterion;

use criterion::{Bencher, Criterion};
use rand::Rng;
use weft::{
    ComponentDef, ComponentType, Error, FieldType, Frame, QueryHandle, StorageKind, System,
    SystemConfig, Value, World,
};

struct Integrate {
    pos: ComponentType,
    vel: ComponentType,
    q: QueryHandle,
}

impl System for Integrate {
    fn configure(&mut self, cfg: &mut SystemConfig) {
        self.q = cfg
            .query()
            .with(self.pos)
            .with(self.vel)
            .write(self.pos)
            .read(self.vel)
            .build();
    }
    fn execute(&mut self, fx: &mut Frame) -> Result<(), Error> {
        let delta = fx.delta();
        for e in fx.current(self.q) {
            let dx = {
                let facet = fx.entity(e);
                let v = facet.read(self.vel)?;
                v.num("dx")?
            };
            let mut facet = fx.entity(e);
            let mut pos = facet.write(self.pos)?;
            let x = pos.num("x")?;
            pos.set("x", x + dx * delta)?;
        }
        Ok(())
    }
}

fn bench_world() -> (World, ComponentType, ComponentType) {
    let mut builder = World::builder();
    builder.max_entities(4096);
    let pos = builder
        .register_component(
            ComponentDef::new("Position")
                .field("x", FieldType::Float64)
                .field("y", FieldType::Float64),
        )
        .unwrap();
    let vel = builder
        .register_component(
            ComponentDef::new("Velocity")
                .field("dx", FieldType::Float32)
                .field("dy", FieldType::Float32)
                .storage(StorageKind::Packed),
        )
        .unwrap();
    builder
        .register_system(Integrate {
            pos,
            vel,
            q: QueryHandle::default(),
        })
        .unwrap();
    let world = builder.build().unwrap();
    (world, pos, vel)
}

fn empty_frame(b: &mut Bencher) {
    let (mut world, _pos, _vel) = bench_world();
    world.execute_at(0.0, 0.0).unwrap();
    let mut t = 0.0;
    b.iter(|| {
        t += 0.016;
        world.execute_at(t, 0.016).unwrap();
    });
}

fn frame_with_movers(b: &mut Bencher) {
    let (mut world, pos, vel) = bench_world();
    let mut rng = rand::thread_rng();
    for _ in 0..1024 {
        world
            .create_entity(&[
                (pos, &[("x", Value::Num(rng.gen_range(-100.0..100.0)))]),
                (vel, &[("dx", Value::Num(rng.gen_range(-1.0..1.0)))]),
            ])
            .unwrap();
    }
    let mut t = 0.0;
    b.iter(|| {
        t += 0.016;
        world.execute_at(t, 0.016).unwrap();
    });
}

fn benches(c: &mut Criterion) {
    c.bench_function("empty frame", empty_frame);
    c.bench_function("frame with 1024 movers", frame_with_movers);
}

criterion_group!(world_benches, benches);
criterion_main!(world_benches);
