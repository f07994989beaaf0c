//! Weft error module.
//!
//! There are specific types for each error class (`CheckError` for
//! authoring mistakes, `InternalError` for engine invariant violations,
//! `CanceledError` for coroutine cancellation) and additionally one
//! `Error` type that can represent them all. Each error in this module
//! has an `Into<Error>` implementation.

use std::error::Error as StdError;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crate::entity::Entity;

/// A boxed error implementing `Debug`, `Display` and `Error`.
///
/// Validators and coroutines surface user-defined failures through this
/// type.
pub struct BoxedErr(pub Box<dyn StdError + Send + Sync + 'static>);

impl BoxedErr {
    /// Creates a new boxed error.
    pub fn new<T>(err: T) -> Self
    where
        T: StdError + Send + Sync + 'static,
    {
        BoxedErr(Box::new(err))
    }
}

impl AsRef<dyn StdError> for BoxedErr {
    fn as_ref(&self) -> &(dyn StdError + 'static) {
        self.0.as_ref()
    }
}

impl Debug for BoxedErr {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{:}", self.0)
    }
}

impl Display for BoxedErr {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.as_ref())
    }
}

impl StdError for BoxedErr {}

/// A plain-message error, used when a validator or coroutine fails with
/// nothing more structured than a string.
#[derive(Debug)]
pub struct MessageError(pub String);

impl Display for MessageError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl StdError for MessageError {}

/// Authoring mistakes: misuse of the API that is discoverable before
/// production. These are never caught internally.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    /// An operation was attempted in a world state that does not permit it.
    WrongState {
        /// The offending operation.
        op: &'static str,
        /// A description of the state the world was in.
        state: &'static str,
    },
    /// A fixed-capacity storage (or the entity pool itself) is full.
    CapacityExhausted {
        /// The component type name, or `"entities"` for the pool.
        name: String,
        /// The capacity that was exhausted.
        capacity: u32,
    },
    /// A supplied field value named a field the schema does not have.
    UnknownField {
        /// The component type name.
        component: String,
        /// The unknown field name.
        field: String,
    },
    /// A value of the wrong kind was written to a field.
    BadValue {
        /// The component type name.
        component: String,
        /// The field name.
        field: String,
    },
    /// Read or write access without a matching declared entitlement.
    NotEntitled {
        /// The component type name.
        component: String,
        /// The access that was attempted.
        access: &'static str,
    },
    /// `add` of a component the entity already has.
    AlreadyPresent {
        /// The component type name.
        component: String,
    },
    /// `remove` or `read` of a component the entity does not have.
    NotPresent {
        /// The component type name.
        component: String,
    },
    /// An entity handle whose generation no longer matches.
    StaleEntity {
        /// The stale handle.
        entity: Entity,
    },
    /// An operation on an entity that is deleted or marked for deletion.
    NotAlive {
        /// The dead handle.
        entity: Entity,
    },
    /// The schedule graph has a cycle no explicit constraint breaks.
    CycleDetected {
        /// Names of the systems participating in the cycle.
        systems: Vec<String>,
    },
    /// Two registrations of the same system type disagree on a prop.
    ConflictingProps {
        /// The system type name.
        system: String,
        /// The conflicting key.
        key: &'static str,
    },
    /// A schedule constraint names a system that is not in the group.
    UnknownSystem {
        /// The system type name used in the constraint.
        system: String,
    },
    /// A component type was registered under an already-taken name.
    DuplicateComponent {
        /// The duplicated name.
        name: String,
    },
    /// A component schema exceeds `MAX_NUM_FIELDS`.
    TooManyFields {
        /// The component type name.
        component: String,
    },
}

impl Display for CheckError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            CheckError::WrongState { op, state } => {
                write!(f, "cannot {} while the world is {}", op, state)
            }
            CheckError::CapacityExhausted { ref name, capacity } => {
                write!(f, "storage for {} is full (capacity {})", name, capacity)
            }
            CheckError::UnknownField {
                ref component,
                ref field,
            } => write!(f, "component {} has no field named {}", component, field),
            CheckError::BadValue {
                ref component,
                ref field,
            } => write!(
                f,
                "value of the wrong kind for field {}.{}",
                component, field
            ),
            CheckError::NotEntitled {
                ref component,
                access,
            } => write!(f, "no {} entitlement declared for {}", access, component),
            CheckError::AlreadyPresent { ref component } => {
                write!(f, "entity already has component {}", component)
            }
            CheckError::NotPresent { ref component } => {
                write!(f, "entity does not have component {}", component)
            }
            CheckError::StaleEntity { entity } => {
                write!(f, "stale entity handle {:?}", entity)
            }
            CheckError::NotAlive { entity } => {
                write!(f, "entity {:?} is deleted or marked for deletion", entity)
            }
            CheckError::CycleDetected { ref systems } => {
                write!(f, "schedule cycle between systems {:?}", systems)
            }
            CheckError::ConflictingProps { ref system, key } => {
                write!(f, "conflicting values for prop {:?} of {}", key, system)
            }
            CheckError::UnknownSystem { ref system } => {
                write!(f, "schedule constraint names unknown system {}", system)
            }
            CheckError::DuplicateComponent { ref name } => {
                write!(f, "component name {} is already registered", name)
            }
            CheckError::TooManyFields { ref component } => {
                write!(f, "component {} declares too many fields", component)
            }
        }
    }
}

impl StdError for CheckError {}

/// A should-never-happen state, indicating a bug in the engine itself
/// rather than in the calling code.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalError {
    /// What invariant was violated.
    pub context: &'static str,
}

impl InternalError {
    pub(crate) fn new(context: &'static str) -> Self {
        InternalError { context }
    }
}

impl Display for InternalError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "internal invariant violated: {}", self.context)
    }
}

impl StdError for InternalError {}

/// Delivered to a coroutine chain when one of its members is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanceledError;

impl Display for CanceledError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "coroutine was canceled")
    }
}

impl StdError for CanceledError {}

/// The Weft error type. This is an enum which is able to represent
/// all error types of this library.
#[derive(Debug)]
pub enum Error {
    /// An authoring mistake, surfaced synchronously from the offending call.
    Check(CheckError),
    /// An engine invariant violation.
    Internal(InternalError),
    /// A coroutine cancellation.
    Canceled(CanceledError),
    /// A user-thrown error from a validator, system body or coroutine.
    Custom(BoxedErr),
}

impl Error {
    /// Wraps an arbitrary message as a user error. This is the usual way
    /// for a validator to reject a shape mutation.
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Error::Custom(BoxedErr::new(MessageError(msg.into())))
    }

    /// Returns `true` if this error is a coroutine cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(*self, Error::Canceled(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            Error::Check(ref e) => write!(f, "check failed: {}", e),
            Error::Internal(ref e) => write!(f, "{}", e),
            Error::Canceled(ref e) => write!(f, "{}", e),
            Error::Custom(ref e) => write!(f, "{}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::Check(ref e) => Some(e),
            Error::Internal(ref e) => Some(e),
            Error::Canceled(ref e) => Some(e),
            Error::Custom(ref e) => Some(e.as_ref()),
        }
    }
}

impl From<CheckError> for Error {
    fn from(e: CheckError) -> Self {
        Error::Check(e)
    }
}

impl From<InternalError> for Error {
    fn from(e: InternalError) -> Self {
        Error::Internal(e)
    }
}

impl From<CanceledError> for Error {
    fn from(e: CanceledError) -> Self {
        Error::Canceled(e)
    }
}

impl From<BoxedErr> for Error {
    fn from(e: BoxedErr) -> Self {
        Error::Custom(e)
    }
}
