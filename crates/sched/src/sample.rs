//! A small shared list with labelled yield points, used as a test subject.
//!
//! Every operation yields to the driver at fixed points; in between, a
//! thread runs without interruption. The lock is never held across a yield.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::check::assume;
use crate::error::{Outcome, Pruned};
use crate::runtime::{in_scenario, yield_point};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    /// 0 means unbounded.
    capacity: usize,
}

/// Cloning shares the underlying list.
#[derive(Debug)]
pub struct ConcurrentList<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ConcurrentList<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for ConcurrentList<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> ConcurrentList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list that holds at most `capacity` elements; `add` on a full list
    /// fails as an assumption.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { items: VecDeque::new(), capacity })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    pub fn add(&self, elt: T) -> Outcome {
        yield_point("add_1")?;
        let room = {
            let inner = self.inner.lock();
            inner.capacity == 0 || inner.items.len() < inner.capacity
        };
        assume(room, "capacity is reached")?;
        self.inner.lock().items.push_back(elt);
        yield_point("add_2")
    }

    /// Remove the head, waiting (by yielding) while the list is empty.
    pub fn take(&self) -> Result<T, Pruned> {
        loop {
            let head = self.inner.lock().items.pop_front();
            if let Some(elt) = head {
                yield_point("take_2")?;
                return Ok(elt);
            }
            if !in_scenario() {
                return Err(Pruned::new("take on an empty list"));
            }
            yield_point("take_1")?;
        }
    }
}

impl<T: PartialEq> ConcurrentList<T> {
    /// Remove the first occurrence of `elt`.
    pub fn remove(&self, elt: &T) -> Result<bool, Pruned> {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.items.iter().position(|e| e == elt) {
                Some(i) => inner.items.remove(i).is_some(),
                None => false,
            }
        };
        if removed {
            yield_point("remove_1")?;
        } else {
            yield_point("remove_2")?;
        }
        Ok(removed)
    }

    /// Remove every occurrence of `elt`, yielding after each removal.
    pub fn remove_all(&self, elt: &T) -> Result<usize, Pruned> {
        let mut removed = 0;
        loop {
            let found = {
                let mut inner = self.inner.lock();
                match inner.items.iter().position(|e| e == elt) {
                    Some(i) => inner.items.remove(i).is_some(),
                    None => false,
                }
            };
            if !found {
                break;
            }
            removed += 1;
            yield_point("remove_all_1")?;
        }
        yield_point("remove_all_2")?;
        Ok(removed)
    }

    pub fn contains(&self, elt: &T) -> bool {
        self.inner.lock().items.contains(elt)
    }
}

impl<T: Clone> ConcurrentList<T> {
    pub fn contents(&self) -> Vec<T> {
        self.inner.lock().items.iter().cloned().collect()
    }

    /// Visit each element, yielding after every visit. Elements removed
    /// concurrently are skipped.
    pub fn foreach(&self, mut f: impl FnMut(&T)) -> Outcome {
        let mut index = 0;
        loop {
            let Some(elt) = self.inner.lock().items.get(index).cloned() else {
                return Ok(());
            };
            f(&elt);
            yield_point("foreach")?;
            index += 1;
        }
    }
}

impl<T> FromIterator<T> for ConcurrentList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let list = Self::new();
        list.inner.lock().items.extend(iter);
        list
    }
}

impl<T: PartialEq> PartialEq<[T]> for ConcurrentList<T> {
    fn eq(&self, other: &[T]) -> bool {
        self.inner.lock().items.iter().eq(other.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Outside a scenario every yield point is a no-op.

    #[test]
    fn test_add_and_take() {
        let list = ConcurrentList::new();
        list.add(1).unwrap();
        list.add(2).unwrap();
        assert_eq!(list.contents(), [1, 2]);
        assert_eq!(list.take().unwrap(), 1);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_take_on_empty_list_outside_scenario() {
        let list: ConcurrentList<u8> = ConcurrentList::new();
        assert!(list.take().is_err());
    }

    #[test]
    fn test_capacity_prunes() {
        let list = ConcurrentList::with_capacity(1);
        list.add('x').unwrap();
        let err = list.add('y').unwrap_err();
        assert_eq!(err.reason(), "capacity is reached");
        assert_eq!(list.contents(), ['x']);
    }

    #[test]
    fn test_remove_and_remove_all() {
        let list: ConcurrentList<i32> = [1, 2, 1, 3, 1].into_iter().collect();
        assert!(list.remove(&2).unwrap());
        assert!(!list.remove(&7).unwrap());
        assert_eq!(list.remove_all(&1).unwrap(), 3);
        assert!(list == [3][..]);
        assert!(list.contains(&3));
    }

    #[test]
    fn test_foreach_visits_in_order() {
        let list: ConcurrentList<&str> = ["a", "b"].into_iter().collect();
        let mut seen = Vec::new();
        list.foreach(|e| seen.push(*e)).unwrap();
        assert_eq!(seen, ["a", "b"]);
    }
}
