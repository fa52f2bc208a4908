//! Process scheduling: semaphores, ready lists and process switches.
//!
//! The scheduler is the value of the `Processor` association. Its process
//! lists are linked lists indexed by priority minus one.

use log::{debug, info};

use crate::{
    Interpreter, Value, VmError,
    interpreter::small,
    special::{
        ASSOCIATION_VALUE, LINK_NEXT, LIST_FIRST, LIST_LAST, PROCESS_MY_LIST, PROCESS_PRIORITY,
        PROCESS_SUSPENDED_CONTEXT, SCHEDULER_ACTIVE_PROCESS, SCHEDULER_ASSOCIATION,
        SCHEDULER_PROCESS_LISTS, SEMAPHORE_EXCESS_SIGNALS,
    },
};

impl Interpreter {
    pub fn scheduler(&self) -> Result<Value, VmError> {
        let association = self.special_object(SCHEDULER_ASSOCIATION)?;
        Ok(self.memory.fetch(association, ASSOCIATION_VALUE)?)
    }

    pub fn active_process(&self) -> Result<Value, VmError> {
        Ok(self.memory.fetch(self.scheduler()?, SCHEDULER_ACTIVE_PROCESS)?)
    }

    /// Starts executing the suspended context of the active process.
    pub(crate) fn load_initial_context(&mut self) -> Result<(), VmError> {
        let process = self.active_process()?;
        let context = self.memory.fetch(process, PROCESS_SUSPENDED_CONTEXT)?;
        if context == self.state.special.nil {
            return Err(VmError::NoRunnableProcess);
        }
        self.fetch_context_registers(context)?;
        self.state.reclaimable_contexts = 0;
        info!("resuming process {process:?} in context {context:?}");
        Ok(())
    }

    fn priority_of(&self, process: Value) -> Result<usize, VmError> {
        Ok(self.memory.fetch_small(process, PROCESS_PRIORITY)?.max(1) as usize)
    }

    pub(crate) fn is_empty_list(&self, list: Value) -> Result<bool, VmError> {
        Ok(self.memory.fetch(list, LIST_FIRST)? == self.state.special.nil)
    }

    pub(crate) fn add_last_link(&mut self, link: Value, list: Value) -> Result<(), VmError> {
        if self.is_empty_list(list)? {
            self.memory.store(list, LIST_FIRST, link)?;
        } else {
            let last = self.memory.fetch(list, LIST_LAST)?;
            self.memory.store(last, LINK_NEXT, link)?;
        }
        self.memory.store(list, LIST_LAST, link)?;
        self.memory.store(link, PROCESS_MY_LIST, list)?;
        Ok(())
    }

    pub(crate) fn remove_first_link(&mut self, list: Value) -> Result<Value, VmError> {
        let nil = self.state.special.nil;
        let first = self.memory.fetch(list, LIST_FIRST)?;
        let last = self.memory.fetch(list, LIST_LAST)?;
        if first == last {
            self.memory.store(list, LIST_FIRST, nil)?;
            self.memory.store(list, LIST_LAST, nil)?;
        } else {
            let next = self.memory.fetch(first, LINK_NEXT)?;
            self.memory.store(list, LIST_FIRST, next)?;
        }
        self.memory.store(first, LINK_NEXT, nil)?;
        self.memory.store(first, PROCESS_MY_LIST, nil)?;
        Ok(first)
    }

    /// Puts `process` at the back of the ready list for its priority.
    pub(crate) fn sleep(&mut self, process: Value) -> Result<(), VmError> {
        let priority = self.priority_of(process)?;
        let lists = self.memory.fetch(self.scheduler()?, SCHEDULER_PROCESS_LISTS)?;
        let list = self.memory.fetch(lists, priority - 1)?;
        self.add_last_link(process, list)
    }

    /// Makes `process` runnable, preempting the active one if it has a higher
    /// priority.
    pub(crate) fn resume(&mut self, process: Value) -> Result<(), VmError> {
        let active = self.active_process()?;
        if self.priority_of(process)? > self.priority_of(active)? {
            self.sleep(active)?;
            self.transfer_to(process)
        } else {
            self.sleep(process)
        }
    }

    pub(crate) fn wake_highest_priority(&mut self) -> Result<Value, VmError> {
        let lists = self.memory.fetch(self.scheduler()?, SCHEDULER_PROCESS_LISTS)?;
        let mut priority = self.memory.pointer_len(lists);
        while priority > 0 {
            let list = self.memory.fetch(lists, priority - 1)?;
            if !self.is_empty_list(list)? {
                return self.remove_first_link(list);
            }
            priority -= 1;
        }
        Err(VmError::NoRunnableProcess)
    }

    /// Saves the active context into the current process and switches to
    /// `process`.
    pub(crate) fn transfer_to(&mut self, process: Value) -> Result<(), VmError> {
        let nil = self.state.special.nil;
        let scheduler = self.scheduler()?;
        let old = self.memory.fetch(scheduler, SCHEDULER_ACTIVE_PROCESS)?;
        self.store_context_registers()?;
        self.memory
            .store(old, PROCESS_SUSPENDED_CONTEXT, self.state.active_context)?;
        self.memory.store(scheduler, SCHEDULER_ACTIVE_PROCESS, process)?;

        let context = self.memory.fetch(process, PROCESS_SUSPENDED_CONTEXT)?;
        self.memory.store(process, PROCESS_SUSPENDED_CONTEXT, nil)?;
        self.fetch_context_registers(context)?;
        self.state.reclaimable_contexts = 0;
        debug!("process switch {old:?} -> {process:?}");
        Ok(())
    }

    pub(crate) fn synchronous_signal(&mut self, semaphore: Value) -> Result<(), VmError> {
        if self.is_empty_list(semaphore)? {
            let excess = self
                .memory
                .fetch_small(semaphore, SEMAPHORE_EXCESS_SIGNALS)?;
            self.memory
                .store(semaphore, SEMAPHORE_EXCESS_SIGNALS, small(excess + 1))?;
            Ok(())
        } else {
            let process = self.remove_first_link(semaphore)?;
            self.resume(process)
        }
    }

    /// Consumes one excess signal or blocks the active process on `semaphore`.
    pub(crate) fn wait(&mut self, semaphore: Value) -> Result<(), VmError> {
        let excess = self
            .memory
            .fetch_small(semaphore, SEMAPHORE_EXCESS_SIGNALS)?;
        if excess > 0 {
            self.memory
                .store(semaphore, SEMAPHORE_EXCESS_SIGNALS, small(excess - 1))?;
            return Ok(());
        }
        let active = self.active_process()?;
        self.add_last_link(active, semaphore)?;
        let next = self.wake_highest_priority()?;
        self.transfer_to(next)
    }

    /// Lets another ready process of the same priority run.
    pub(crate) fn yield_process(&mut self) -> Result<(), VmError> {
        let active = self.active_process()?;
        let priority = self.priority_of(active)?;
        let lists = self.memory.fetch(self.scheduler()?, SCHEDULER_PROCESS_LISTS)?;
        let list = self.memory.fetch(lists, priority - 1)?;
        if self.is_empty_list(list)? {
            return Ok(());
        }
        self.sleep(active)?;
        let next = self.wake_highest_priority()?;
        self.transfer_to(next)
    }
}

#[cfg(test)]
mod tests {
    use crate::Value;
    use crate::bootstrap::Bootstrap;
    use crate::object::MethodHeader;
    use crate::special::{LIST_FIRST, PROCESS_SUSPENDED_CONTEXT, SEMAPHORE_EXCESS_SIGNALS};

    fn small(n: i32) -> Value {
        Value::small(n).expect("small")
    }

    #[test]
    fn signal_without_waiters_counts_excess() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let method = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let semaphore = boot.semaphore();
        let mut vm = boot.start(method).expect("interpreter");

        vm.synchronous_signal(semaphore).expect("signal");
        vm.synchronous_signal(semaphore).expect("signal");
        assert_eq!(vm.memory.fetch(semaphore, SEMAPHORE_EXCESS_SIGNALS), Ok(small(2)));

        let context = vm.state.active_context;
        vm.wait(semaphore).expect("wait");
        assert_eq!(vm.memory.fetch(semaphore, SEMAPHORE_EXCESS_SIGNALS), Ok(small(1)));
        assert_eq!(vm.state.active_context, context);
    }

    #[test]
    fn waiting_switches_and_signal_preempts() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let main = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let other = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x71, 0x7C]);
        let other_context = boot.context(other, boot.nil);
        let low = boot.process(2, other_context);
        boot.make_ready(low);
        let semaphore = boot.semaphore();
        let mut vm = boot.start(main).expect("interpreter");

        let main_process = vm.active_process().expect("active");
        let main_context = vm.state.active_context;

        vm.wait(semaphore).expect("wait");
        assert_eq!(vm.active_process().expect("active"), low);
        assert_eq!(vm.state.active_context, other_context);
        assert_eq!(vm.memory.fetch(semaphore, LIST_FIRST), Ok(main_process));
        assert_eq!(vm.memory.fetch(main_process, PROCESS_SUSPENDED_CONTEXT), Ok(main_context));

        // the main process runs at a higher priority, so the signal switches back
        vm.synchronous_signal(semaphore).expect("signal");
        assert_eq!(vm.active_process().expect("active"), main_process);
        assert_eq!(vm.state.active_context, main_context);
        assert!(vm.is_empty_list(semaphore).expect("list"));
        assert_eq!(vm.memory.fetch(low, PROCESS_SUSPENDED_CONTEXT), Ok(other_context));
    }

    #[test]
    fn yield_round_robins_equal_priorities() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let main = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let peer_context = boot.context(main, boot.nil);
        let peer = boot.process(Bootstrap::USER_PRIORITY, peer_context);
        boot.make_ready(peer);
        let mut vm = boot.start(main).expect("interpreter");
        let first = vm.active_process().expect("active");

        vm.yield_process().expect("yield");
        assert_eq!(vm.active_process().expect("active"), peer);
        vm.yield_process().expect("yield");
        assert_eq!(vm.active_process().expect("active"), first);
    }
}
