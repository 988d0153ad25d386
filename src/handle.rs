//! Value-type handles to objects replicated on every peer.
//!
//! A [`SharedHandle`] is not a pointer. It is a small id that every peer
//! maps to its own replica of the same logical object, so it can travel as
//! an ordinary invocation argument where an address never could. Creation
//! is collective: every peer must call `make_shared_handle` in the same
//! order with the same type, which is what keeps the ids aligned; the
//! communicator verifies this with a reduction at creation time.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Handle to one peer-replicated object, resolvable on any peer via
/// `Comm::resolve`.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SharedHandle<T> {
    id: u32,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> SharedHandle<T> {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

impl<T> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedHandle<T> {}

impl<T> std::fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedHandle<{}>({})", std::any::type_name::<T>(), self.id)
    }
}

/// This peer's replicas, indexed by handle id.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    objects: RefCell<Vec<Box<dyn Any>>>,
}

impl HandleRegistry {
    pub fn register<T: 'static>(&self, object: Rc<RefCell<T>>) -> u32 {
        let mut objects = self.objects.borrow_mut();
        objects.push(Box::new(object));
        (objects.len() - 1) as u32
    }

    pub fn resolve<T: 'static>(&self, id: u32) -> Option<Rc<RefCell<T>>> {
        self.objects
            .borrow()
            .get(id as usize)?
            .downcast_ref::<Rc<RefCell<T>>>()
            .cloned()
    }

    pub fn clear(&self) {
        self.objects.borrow_mut().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_and_resolves_in_order() {
        let registry = HandleRegistry::default();
        let a = Rc::new(RefCell::new(1u32));
        let b = Rc::new(RefCell::new(String::from("x")));
        assert_eq!(registry.register(a.clone()), 0);
        assert_eq!(registry.register(b), 1);

        *registry.resolve::<u32>(0).unwrap().borrow_mut() += 1;
        assert_eq!(*a.borrow(), 2);
        assert_eq!(*registry.resolve::<String>(1).unwrap().borrow(), "x");
    }

    #[test]
    fn wrong_type_or_id_misses() {
        let registry = HandleRegistry::default();
        registry.register(Rc::new(RefCell::new(7u8)));
        assert!(registry.resolve::<u16>(0).is_none());
        assert!(registry.resolve::<u8>(1).is_none());
    }

    #[test]
    fn handles_serialize_as_plain_ids() {
        let handle = SharedHandle::<Vec<u64>>::new(3);
        let bytes = bincode::serialize(&handle).unwrap();
        let back: SharedHandle<Vec<u64>> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.id(), 3);
    }
}
