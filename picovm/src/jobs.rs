//! Promises and the job queue.
//!
//! The queue register holds `undefined` when empty, the job itself when a
//! single job is queued, and otherwise the first cell of a circular doubly
//! linked list of `[prev, job, next]` cells. Every job is a closure called
//! with no arguments.
//!
//! A promise is a property list whose prototype is the `PromiseProto`
//! builtin. Its first key/value pair is internal: the key slot holds the
//! status, the value slot holds the subscribers while pending and the
//! settled value afterwards. The status values are never valid property
//! keys, so lookups cannot hit them.
use crate::error::Error;
use crate::image::format::Builtin;
use crate::stack::CallFlags;
use crate::value::{TypeCode, Value};
use crate::vm::{AsyncCompletion, ObjRef, Vm};

const PENDING: Value = Value::Undefined;
const RESOLVED: Value = Value::True;
const REJECTED: Value = Value::False;

const STATUS_SLOT: usize = 2;
const OUT_SLOT: usize = 3;

/// Settled state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

impl Vm<'_> {
    pub(crate) fn new_promise(&mut self) -> Result<Value, Error> {
        let proto = self.builtin(Builtin::PromiseProto);
        if proto.is_nullish() {
            return Err(Error::TypeError("image has no promise prototype"));
        }
        let ptr = self.allocate(8, TypeCode::PropertyList)?;
        self.heap.set_slot(ptr, 0, Value::Null);
        self.heap.set_slot(ptr, 1, proto);
        self.heap.set_slot(ptr, STATUS_SLOT, PENDING);
        self.heap.set_slot(ptr, OUT_SLOT, Value::Undefined);
        Ok(Value::Ptr(ptr))
    }

    fn promise_ref(&self, value: Value) -> Option<ObjRef> {
        self.object_of_type(value, TypeCode::PropertyList)
            .filter(|&head| self.is_promise(head))
    }

    pub(crate) fn promise_state(&self, value: Value) -> Option<(PromiseState, Value)> {
        let head = self.promise_ref(value)?;
        let state = match self.slot_of(head, STATUS_SLOT) {
            RESOLVED => PromiseState::Resolved,
            REJECTED => PromiseState::Rejected,
            _ => PromiseState::Pending,
        };
        Some((state, self.slot_of(head, OUT_SLOT)))
    }

    /// Register `subscriber` to be scheduled when `promise` settles.
    pub(crate) fn subscribe(&mut self, promise: Value, subscriber: Value) -> Result<(), Error> {
        let head = self
            .promise_ref(promise)
            .ok_or(Error::TypeError("not a promise"))?;
        match self.slot_of(head, OUT_SLOT) {
            Value::Undefined => self.set_slot_of(head, OUT_SLOT, subscriber),
            existing if self.deep_type_of(existing) == TypeCode::Array => {
                self.array_push(existing, subscriber)
            }
            existing => self.rooted(&[promise, existing, subscriber], |vm, base| {
                let list = vm.new_array_with_capacity(2)?;
                vm.rooted(&[list], |vm, list_slot| {
                    vm.array_set(vm.scratch[list_slot], 0, vm.scratch[base + 1])?;
                    vm.array_set(vm.scratch[list_slot], 1, vm.scratch[base + 2])?;
                    let head = vm
                        .promise_ref(vm.scratch[base])
                        .ok_or(Error::Corrupt("promise lost during subscribe"))?;
                    vm.set_slot_of(head, OUT_SLOT, vm.scratch[list_slot])
                })
            }),
        }
    }

    /// Deliver the outcome of an async operation to `callback`.
    pub(crate) fn complete(
        &mut self,
        callback: Value,
        is_success: bool,
        result: Value,
    ) -> Result<(), Error> {
        match callback {
            Value::NoOpFunction => Ok(()),
            _ if self.promise_ref(callback).is_some() => {
                self.settle(callback, is_success, result)
            }
            _ if self.deep_type_of(callback) == TypeCode::Closure => {
                self.schedule(callback, is_success, result)
            }
            _ => Err(Error::TypeError("invalid async callback")),
        }
    }

    fn settle(&mut self, promise: Value, is_success: bool, result: Value) -> Result<(), Error> {
        let Some((PromiseState::Pending, subscribers)) = self.promise_state(promise) else {
            log::trace!("ignoring second settlement of {promise}");
            return Ok(());
        };
        let head = self
            .promise_ref(promise)
            .ok_or(Error::Corrupt("promise lost during settle"))?;
        self.set_slot_of(head, STATUS_SLOT, if is_success { RESOLVED } else { REJECTED })?;
        self.set_slot_of(head, OUT_SLOT, result)?;

        self.rooted(&[subscribers, result], |vm, base| {
            if vm.deep_type_of(vm.scratch[base]) == TypeCode::Array {
                let list = vm
                    .obj_ref(vm.scratch[base])
                    .ok_or(Error::Corrupt("subscriber list lost"))?;
                let count = vm.array_length(list);
                for i in 0..count {
                    let list = vm
                        .obj_ref(vm.scratch[base])
                        .ok_or(Error::Corrupt("subscriber list lost"))?;
                    let subscriber = vm.array_element(list, i);
                    vm.schedule(subscriber, is_success, vm.scratch[base + 1])?;
                }
                Ok(())
            } else if vm.scratch[base] == Value::Undefined {
                Ok(())
            } else {
                vm.schedule(vm.scratch[base], is_success, vm.scratch[base + 1])
            }
        })
    }

    /// Queue a job that calls `subscriber(isSuccess, result)`.
    pub(crate) fn schedule(
        &mut self,
        subscriber: Value,
        is_success: bool,
        result: Value,
    ) -> Result<(), Error> {
        let job = self.rooted(&[subscriber, result], |vm, base| {
            let job = vm.allocate_slots(5, TypeCode::Closure, Value::Undefined)?;
            vm.heap.set_slot(job, 0, vm.builtin(Builtin::AsyncContinue));
            vm.heap.set_slot(job, 1, vm.scratch[base]);
            vm.heap.set_slot(job, 2, Value::from_bool(is_success));
            vm.heap.set_slot(job, 3, vm.scratch[base + 1]);
            Ok(Value::Ptr(job))
        })?;
        self.enqueue_job(job)
    }

    pub(crate) fn enqueue_job(&mut self, job: Value) -> Result<(), Error> {
        let queue = self.job_queue;
        if queue == Value::Undefined {
            self.job_queue = job;
            return Ok(());
        }
        self.rooted(&[job], |vm, base| {
            if vm.deep_type_of(vm.job_queue) == TypeCode::Closure {
                // Single job: grow into a two-cell ring.
                let first = vm.allocate_slots(3, TypeCode::FixedLengthArray, Value::Undefined)?;
                vm.heap.set_slot(first, 1, vm.job_queue);
                vm.job_queue = Value::Ptr(first);
            }
            let cell = vm.allocate_slots(3, TypeCode::FixedLengthArray, Value::Undefined)?;
            let Value::Ptr(head) = vm.job_queue else {
                return Err(Error::Corrupt("job queue is not a heap list"));
            };
            let tail = match vm.heap.slot(head, 0) {
                Value::Ptr(tail) => tail,
                _ => head,
            };
            vm.heap.set_slot(cell, 0, Value::Ptr(tail));
            vm.heap.set_slot(cell, 1, vm.scratch[base]);
            vm.heap.set_slot(cell, 2, Value::Ptr(head));
            vm.heap.set_slot(tail, 2, Value::Ptr(cell));
            vm.heap.set_slot(head, 0, Value::Ptr(cell));
            Ok(())
        })
    }

    pub(crate) fn dequeue_job(&mut self) -> Result<Option<Value>, Error> {
        let queue = self.job_queue;
        match self.deep_type_of(queue) {
            TypeCode::Undefined => Ok(None),
            TypeCode::Closure => {
                self.job_queue = Value::Undefined;
                Ok(Some(queue))
            }
            TypeCode::FixedLengthArray => {
                let Value::Ptr(head) = queue else {
                    return Err(Error::Corrupt("job queue is not a heap list"));
                };
                let job = self.heap.slot(head, 1);
                let (Value::Ptr(prev), Value::Ptr(next)) =
                    (self.heap.slot(head, 0), self.heap.slot(head, 2))
                else {
                    return Err(Error::Corrupt("broken job queue links"));
                };
                if next == head {
                    self.job_queue = Value::Undefined;
                } else if next == prev {
                    // One job left: collapse back to the bare job.
                    self.job_queue = self.heap.slot(next, 1);
                } else {
                    self.heap.set_slot(prev, 2, Value::Ptr(next));
                    self.heap.set_slot(next, 0, Value::Ptr(prev));
                    self.job_queue = Value::Ptr(next);
                }
                Ok(Some(job))
            }
            _ => Err(Error::Corrupt("job queue holds an unexpected value")),
        }
    }

    pub(crate) fn has_pending_jobs(&self) -> bool {
        self.job_queue != Value::Undefined
    }

    /// Run queued jobs in FIFO order until the queue is empty. A failing
    /// job stops the drain; the jobs behind it stay queued.
    pub(crate) fn drain_jobs(&mut self) -> Result<(), Error> {
        while let Some(job) = self.dequeue_job()? {
            log::trace!("running job {job}");
            self.call_from_host(job, &[], CallFlags::CALLED_FROM_HOST | CallFlags::VOID_CALL)?;
        }
        Ok(())
    }

    /// Begin an asynchronous host operation. Only valid inside a host
    /// function: the host returns [`AsyncCompletion::result`] and later
    /// calls [`AsyncCompletion::callback`] with `(isSuccess, value)`.
    pub fn async_start(&mut self) -> Result<AsyncCompletion, Error> {
        self.ensure_alive()?;
        if self.host_depth == 0 {
            return Err(Error::NotInHostCall);
        }
        let offered = std::mem::replace(&mut self.cps_callback, Value::Undefined);
        let (target, result) = if offered != Value::Undefined {
            (offered, Value::Deleted)
        } else if self.host_call_void {
            (Value::NoOpFunction, Value::Undefined)
        } else {
            let promise = self.new_promise()?;
            (promise, promise)
        };
        let callback = self.rooted(&[target], |vm, base| {
            let ptr = vm.allocate_slots(3, TypeCode::Closure, Value::Undefined)?;
            vm.heap.set_slot(ptr, 0, vm.builtin(Builtin::AsyncHostCallback));
            vm.heap.set_slot(ptr, 1, vm.scratch[base]);
            Ok(Value::Ptr(ptr))
        })?;
        // Allocating the callback may have moved a fresh promise.
        let result = match result {
            Value::Ptr(_) => self.slot_of(
                self.obj_ref(callback)
                    .ok_or(Error::Corrupt("callback closure lost"))?,
                1,
            ),
            other => other,
        };
        Ok(AsyncCompletion { callback, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::ImageBuilder;

    fn closure(vm: &mut Vm<'_>, tag: i16) -> Value {
        let ptr = vm
            .allocate_slots(2, TypeCode::Closure, Value::Int(tag))
            .unwrap();
        Value::Ptr(ptr)
    }

    #[test]
    fn queue_is_fifo_across_representations() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        for tag in 0..4 {
            let job = closure(&mut vm, tag);
            vm.enqueue_job(job).unwrap();
        }
        vm.collect_garbage(false);
        let mut seen = Vec::new();
        while let Some(job) = vm.dequeue_job().unwrap() {
            let obj = vm.obj_ref(job).unwrap();
            seen.push(vm.slot_of(obj, 0));
        }
        assert_eq!(seen, (0..4).map(Value::Int).collect::<Vec<_>>());
        assert!(!vm.has_pending_jobs());
    }

    #[test]
    fn two_jobs_collapse_to_one() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let a = closure(&mut vm, 1);
        vm.enqueue_job(a).unwrap();
        let b = closure(&mut vm, 2);
        vm.enqueue_job(b).unwrap();
        assert_eq!(vm.deep_type_of(vm.job_queue), TypeCode::FixedLengthArray);
        vm.dequeue_job().unwrap();
        assert_eq!(vm.deep_type_of(vm.job_queue), TypeCode::Closure);
    }

    #[test]
    fn settling_schedules_every_subscriber_once() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let promise = vm.new_promise().unwrap();
        let handle = vm.new_handle(promise);
        for tag in 0..3 {
            let subscriber = closure(&mut vm, tag);
            let promise = vm.handle_value(&handle).unwrap();
            vm.subscribe(promise, subscriber).unwrap();
        }
        let promise = vm.handle_value(&handle).unwrap();
        vm.complete(promise, true, Value::Int(42)).unwrap();
        let promise = vm.handle_value(&handle).unwrap();
        vm.complete(promise, false, Value::Int(0)).unwrap();
        let promise = vm.handle_value(&handle).unwrap();
        assert_eq!(
            vm.promise_state(promise),
            Some((PromiseState::Resolved, Value::Int(42)))
        );
        let mut jobs = 0;
        while let Some(job) = vm.dequeue_job().unwrap() {
            let obj = vm.obj_ref(job).unwrap();
            assert_eq!(vm.slot_of(obj, 2), Value::True);
            assert_eq!(vm.slot_of(obj, 3), Value::Int(42));
            jobs += 1;
        }
        assert_eq!(jobs, 3);
    }

    #[test]
    fn promise_state_is_not_an_own_key() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let promise = vm.new_promise().unwrap();
        let keys = vm.own_keys(promise).unwrap();
        assert_eq!(vm.get_property(keys, Value::StrLength).unwrap(), Value::Int(0));
        assert_eq!(vm.get_property(promise, Value::Int(0)).unwrap(), Value::Undefined);
    }

    #[test]
    fn async_start_outside_host_call() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        assert_eq!(vm.async_start(), Err(Error::NotInHostCall));
    }
}
