//! Process-wide registry of remotely invocable handlers.
//!
//! A handler is a zero-sized type implementing [`RemoteFn`], announced once
//! with [`remote!`](crate::remote). Announcements are gathered at module
//! initialization, sorted by their type path, and assigned dense 16-bit
//! ids; every peer runs the same binary, so every peer derives the same id
//! for the same handler without any exchange. The registry is written only
//! during that collection and read during receive dispatch.
//!
//! Handlers are stateless by construction: the type carries no fields, so
//! everything an invocation needs must travel in its serialized arguments.
//! That is what makes the 16-bit id a complete description of the callable
//! on the remote side.

use std::sync::LazyLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::comm::Comm;
use crate::error::CommError;
use crate::wire::ArgReader;

/// A handler that can be invoked on a remote peer.
///
/// `invoke` runs on the destination peer with the deserialized arguments
/// and may itself enqueue further invocations through the communicator; it
/// must not call collectives (`barrier`, `cf_barrier`, reductions), which
/// are only valid from the top-level control flow.
pub trait RemoteFn: 'static {
    type Args: Serialize + DeserializeOwned;

    fn invoke(comm: &Comm, args: Self::Args) -> Result<(), CommError>;
}

/// Announces a handler type (and its broadcast relay) to the registry.
///
/// ```ignore
/// struct Touch;
///
/// impl RemoteFn for Touch {
///     type Args = u64;
///     fn invoke(comm: &Comm, key: u64) -> Result<(), CommError> { .. }
/// }
///
/// starling::remote!(Touch);
/// ```
#[macro_export]
macro_rules! remote {
    ($ty:ty) => {
        $crate::inventory::submit! {
            $crate::registry::RemoteEntry::of::<$ty>()
        }
        $crate::inventory::submit! {
            $crate::registry::RemoteEntry::of::<$crate::comm::BcastRelay<$ty>>()
        }
    };
}

/// A type-erased registration record, constructed by [`remote!`](crate::remote).
pub struct RemoteEntry {
    name: fn() -> &'static str,
    invoke: fn(&Comm, &mut ArgReader<'_>) -> Result<(), CommError>,
}

impl RemoteEntry {
    pub const fn of<F: RemoteFn>() -> Self {
        Self {
            name: type_path::<F>,
            invoke: trampoline::<F>,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        (self.name)()
    }

    pub(crate) fn invoke(&self, comm: &Comm, reader: &mut ArgReader<'_>) -> Result<(), CommError> {
        (self.invoke)(comm, reader)
    }
}

inventory::collect!(RemoteEntry);

fn type_path<F: 'static>() -> &'static str {
    std::any::type_name::<F>()
}

fn trampoline<F: RemoteFn>(comm: &Comm, reader: &mut ArgReader<'_>) -> Result<(), CommError> {
    let args = reader.read_args::<F::Args>()?;
    F::invoke(comm, args)
}

/// The collected handler table. One per process, see [`global`].
pub struct LambdaRegistry {
    ids: ahash::HashMap<&'static str, u16>,
    table: Vec<&'static RemoteEntry>,
}

impl LambdaRegistry {
    /// Collects every announced handler. Panics on a duplicate
    /// registration or on overflowing the 16-bit id space; both mean the
    /// registry could disagree between peers, which silently misdispatches.
    fn collect() -> Self {
        let mut table: Vec<&'static RemoteEntry> = inventory::iter::<RemoteEntry>.into_iter().collect();
        table.sort_by_key(|entry| entry.name());

        for pair in table.windows(2) {
            assert!(
                pair[0].name() != pair[1].name(),
                "handler {} registered multiple times",
                pair[0].name()
            );
        }
        assert!(
            table.len() <= usize::from(u16::MAX) + 1,
            "{} handlers exceed the 16-bit id space",
            table.len()
        );

        let ids = table
            .iter()
            .enumerate()
            .map(|(id, entry)| (entry.name(), id as u16))
            .collect();
        Self { ids, table }
    }

    pub(crate) fn id_of<F: RemoteFn>(&self) -> Result<u16, CommError> {
        self.ids
            .get(type_path::<F>())
            .copied()
            .ok_or(CommError::Unregistered {
                name: type_path::<F>(),
            })
    }

    pub(crate) fn entry(&self, id: u16) -> Option<&'static RemoteEntry> {
        self.table.get(usize::from(id)).copied()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// The process-wide registry, collected on first access.
pub fn global() -> &'static LambdaRegistry {
    static REGISTRY: LazyLock<LambdaRegistry> = LazyLock::new(LambdaRegistry::collect);
    &REGISTRY
}

#[cfg(test)]
mod test {
    use super::*;

    struct First;

    impl RemoteFn for First {
        type Args = ();

        fn invoke(_comm: &Comm, _args: ()) -> Result<(), CommError> {
            Ok(())
        }
    }

    struct Second;

    impl RemoteFn for Second {
        type Args = u32;

        fn invoke(_comm: &Comm, _args: u32) -> Result<(), CommError> {
            Ok(())
        }
    }

    crate::remote!(First);
    crate::remote!(Second);

    struct NeverAnnounced;

    impl RemoteFn for NeverAnnounced {
        type Args = ();

        fn invoke(_comm: &Comm, _args: ()) -> Result<(), CommError> {
            Ok(())
        }
    }

    #[test]
    fn ids_are_stable_and_distinct() {
        let registry = global();
        let first = registry.id_of::<First>().unwrap();
        let second = registry.id_of::<Second>().unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.id_of::<First>().unwrap(), first);
        assert_eq!(
            registry.entry(first).unwrap().name(),
            std::any::type_name::<First>()
        );
    }

    #[test]
    fn relay_is_registered_alongside_the_handler() {
        let registry = global();
        registry.id_of::<crate::comm::BcastRelay<First>>().unwrap();
    }

    #[test]
    fn unregistered_handler_is_an_error() {
        assert!(matches!(
            global().id_of::<NeverAnnounced>(),
            Err(CommError::Unregistered { .. })
        ));
    }

    #[test]
    fn unknown_id_misses_the_table() {
        assert!(global().entry(u16::MAX).is_none());
    }
}
