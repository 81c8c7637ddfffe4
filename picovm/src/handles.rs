use crate::error::Error;
use crate::value::Value;

/// A host-owned GC root. The value it holds is kept alive and updated when
/// the collector moves it. Release it with [`Vm::release_handle`].
///
/// [`Vm::release_handle`]: crate::Vm::release_handle
#[derive(Debug, PartialEq, Eq)]
pub struct Handle {
    index: u32,
}

/// Slot table backing [`Handle`]s. Freed slots are reused.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    slots: Vec<Option<Value>>,
    free: Vec<u32>,
}

impl HandleTable {
    pub fn insert(&mut self, value: Value) -> Handle {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(value);
                Handle { index }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(value));
                Handle { index }
            }
        }
    }

    pub fn get(&self, handle: &Handle) -> Result<Value, Error> {
        self.slots
            .get(handle.index as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidHandle)
    }

    pub fn set(&mut self, handle: &Handle, value: Value) -> Result<(), Error> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot @ Some(_)) => {
                *slot = Some(value);
                Ok(())
            }
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Result<Value, Error> {
        let value = self
            .slots
            .get_mut(handle.index as usize)
            .and_then(Option::take)
            .ok_or(Error::InvalidHandle)?;
        self.free.push(handle.index);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn visit_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in self.slots.iter_mut().flatten() {
            visitor(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_set_remove() {
        let mut table = HandleTable::default();
        let h = table.insert(Value::Int(1));
        assert_eq!(table.get(&h), Ok(Value::Int(1)));
        table.set(&h, Value::True).unwrap();
        assert_eq!(table.get(&h), Ok(Value::True));
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(h), Ok(Value::True));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut table = HandleTable::default();
        let a = table.insert(Value::Int(1));
        let _b = table.insert(Value::Int(2));
        table.remove(a).unwrap();
        let c = table.insert(Value::Int(3));
        assert_eq!(c, Handle { index: 0 });
    }

    #[test]
    fn visitor_sees_live_slots_only() {
        let mut table = HandleTable::default();
        let a = table.insert(Value::Int(1));
        let _b = table.insert(Value::Int(2));
        table.remove(a).unwrap();
        let mut seen = Vec::new();
        table.visit_mut(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![Value::Int(2)]);
    }
}
