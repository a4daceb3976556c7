/*!
 * Surrogates
 * Stand-in identifiers for application objects, classes, and threads
 *
 * The pipeline never holds a strong reference to an application object. An
 * `ObjectRef` names an object by identity and class, optionally with a weak
 * liveness probe the registry can sweep.
 */

mod registry;

pub use registry::SurrogateRegistry;

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Weak};

/// Class of an observed object, identified by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    name: Arc<str>,
}

impl ClassRef {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    /// Class named after a Rust type
    pub fn of<T: ?Sized>() -> Self {
        Self::new(type_name::<T>())
    }

    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }
}

impl From<&str> for ClassRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Handle to an application object as the instrumentation sees it
#[derive(Clone)]
pub struct ObjectRef {
    identity: u64,
    class: ClassRef,
    liveness: Option<Weak<dyn Any + Send + Sync>>,
}

impl ObjectRef {
    /// Object with an identity chosen by the caller and no liveness probe
    ///
    /// Reclamation of such objects must be reported through
    /// `SurrogateRegistry::on_reclaimed`.
    pub fn new(identity: u64, class: impl Into<ClassRef>) -> Self {
        Self {
            identity,
            class: class.into(),
            liveness: None,
        }
    }

    /// Object identified by its allocation, tracked weakly
    pub fn of<T: Any + Send + Sync>(object: &Arc<T>) -> Self {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(object) as Weak<dyn Any + Send + Sync>;
        Self {
            identity: Arc::as_ptr(object) as *const () as usize as u64,
            class: ClassRef::of::<T>(),
            liveness: Some(weak),
        }
    }

    #[inline]
    pub fn identity(&self) -> u64 {
        self.identity
    }

    #[inline]
    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    pub(crate) fn liveness(&self) -> Option<&Weak<dyn Any + Send + Sync>> {
        self.liveness.as_ref()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("identity", &format_args!("{:#x}", self.identity))
            .field("class", &self.class.name)
            .field("tracked", &self.liveness.is_some())
            .finish()
    }
}
