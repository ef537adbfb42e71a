use super::{
    KERNEL_PID, Pid, Process, ProcessError, ProcessState, Thread, ThreadState, Tid, WaitChannel,
};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;

/// All processes and threads.
///
/// None of the methods lock: the kernel keeps the table behind its process
/// lock, and callers hold that lock across whole find-then-modify sequences.
///
/// There is no ready queue. Scheduling order is table order: processes in
/// creation order, and within a process its thread list front to back.
pub struct ProcTable<C> {
    processes: Vec<Process>,
    threads: BTreeMap<Tid, Thread<C>>,
    next_pid: u32,
    next_tid: u64,
}

impl<C> ProcTable<C> {
    /// A table holding only the kernel process.
    #[must_use]
    pub fn new(kernel_directory: PhysicalAddress) -> Self {
        let mut kernel = Process::new(KERNEL_PID, "kernel", kernel_directory);
        kernel.state = ProcessState::Ready;
        Self {
            processes: alloc::vec![kernel],
            threads: BTreeMap::new(),
            next_pid: 1,
            next_tid: 1,
        }
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }

    #[must_use]
    pub fn thread(&self, tid: Tid) -> Option<&Thread<C>> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread<C>> {
        self.threads.get_mut(&tid)
    }

    /// Processes in table order.
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter()
    }

    /// Every thread id in scan order.
    fn scan_order(&self) -> impl Iterator<Item = Tid> + '_ {
        self.processes.iter().flat_map(|p| p.threads.iter().copied())
    }

    /// Append a process in state `New`.
    pub fn insert_process(&mut self, name: &'static str, directory: PhysicalAddress) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.processes.push(Process::new(pid, name, directory));
        pid
    }

    /// Hand out the next thread id.
    pub fn next_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Put `thread` at the head of `pid`'s thread list and make both ready.
    ///
    /// # Errors
    /// If the process does not exist or is being torn down.
    pub fn add_thread(&mut self, pid: Pid, mut thread: Thread<C>) -> Result<Tid, ProcessError> {
        let process = self
            .get_mut(pid)
            .ok_or(ProcessError::UnknownProcess(pid))?;
        if matches!(process.state, ProcessState::Defunct | ProcessState::Truncate) {
            return Err(ProcessError::NotAccepting(pid));
        }

        let tid = thread.tid;
        process.threads.push_front(tid);
        if process.state == ProcessState::New {
            process.state = ProcessState::Ready;
        }
        thread.pid = pid;
        if thread.state == ThreadState::New {
            thread.state = ThreadState::Ready;
        }
        self.threads.insert(tid, thread);
        Ok(tid)
    }

    /// Register a CPU's scheduler loop as a thread of the kernel process.
    pub fn insert_scheduler_thread(&mut self, name: &'static str) -> Tid {
        let tid = self.next_tid();
        let mut thread = Thread::new(tid, name, None);
        thread.state = ThreadState::Scheduler;
        thread.pid = KERNEL_PID;
        if let Some(kernel) = self.get_mut(KERNEL_PID) {
            kernel.threads.push_back(tid);
        }
        self.threads.insert(tid, thread);
        tid
    }

    /// The first `Ready` thread of a `Ready` process, in table order. The
    /// kernel process is always eligible.
    #[must_use]
    pub fn first_ready_thread(&self) -> Option<Tid> {
        self.processes
            .iter()
            .filter(|p| p.is_kernel() || p.state == ProcessState::Ready)
            .flat_map(|p| p.threads.iter().copied())
            .find(|tid| {
                self.threads
                    .get(tid)
                    .is_some_and(|t| t.state == ThreadState::Ready)
            })
    }

    /// Mark `tid` and its process running. Returns the directory to load
    /// and the context to resume.
    pub(crate) fn dispatch(&mut self, tid: Tid) -> Option<(PhysicalAddress, NonNull<C>)> {
        let thread = self.threads.get_mut(&tid)?;
        let context = NonNull::from(&**thread.context.as_ref()?);
        thread.state = ThreadState::Running;
        let pid = thread.pid;

        let process = self.get_mut(pid)?;
        if !process.is_kernel() {
            process.state = ProcessState::Running;
        }
        Some((process.directory, context))
    }

    /// The saved context of `tid`.
    pub(crate) fn context(&self, tid: Tid) -> Option<NonNull<C>> {
        let context = self.threads.get(&tid)?.context.as_ref()?;
        Some(NonNull::from(&**context))
    }

    /// Let the scheduler pick `pid`'s threads again.
    pub fn demote(&mut self, pid: Pid) {
        if let Some(process) = self.get_mut(pid) {
            if !process.is_kernel() && process.state == ProcessState::Running {
                process.state = ProcessState::Ready;
            }
        }
    }

    /// Make every sleeper whose wake time has come ready. Returns how many
    /// woke.
    pub fn wake_sleepers(&mut self, now: u64) -> usize {
        let mut woken = 0;
        for thread in self.threads.values_mut() {
            if thread.state == ThreadState::Sleeping && thread.wake_at <= now {
                thread.state = ThreadState::Ready;
                woken += 1;
            }
        }
        woken
    }

    /// Park `tid` on `channel`.
    pub fn block(&mut self, tid: Tid, channel: WaitChannel) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = ThreadState::Blocked;
            thread.channel = Some(channel);
        }
    }

    /// Wake the first thread blocked on `channel`, in table order.
    ///
    /// Table order puts newer threads of a process first, so this is not a
    /// FIFO of waiters.
    pub fn notify_one(&mut self, channel: WaitChannel) -> Option<Tid> {
        let tid = self.scan_order().find(|tid| self.is_blocked_on(*tid, channel))?;
        self.unblock(tid);
        Some(tid)
    }

    /// Wake every thread blocked on `channel`. Returns how many woke.
    pub fn notify_all(&mut self, channel: WaitChannel) -> usize {
        let waiters: Vec<Tid> = self
            .scan_order()
            .filter(|tid| self.is_blocked_on(*tid, channel))
            .collect();
        for tid in &waiters {
            self.unblock(*tid);
        }
        waiters.len()
    }

    fn is_blocked_on(&self, tid: Tid, channel: WaitChannel) -> bool {
        self.threads
            .get(&tid)
            .is_some_and(|t| t.state == ThreadState::Blocked && t.channel == Some(channel))
    }

    fn unblock(&mut self, tid: Tid) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = ThreadState::Ready;
            thread.channel = None;
        }
    }

    /// Remove an exited thread. If that empties a user process, the process
    /// turns `Defunct` and its pid and directory are returned for teardown.
    pub fn reap(&mut self, tid: Tid) -> Option<(Pid, PhysicalAddress)> {
        if self.threads.get(&tid)?.state != ThreadState::Exited {
            return None;
        }
        let thread = self.threads.remove(&tid)?;
        let process = self.get_mut(thread.pid)?;
        process.threads.retain(|t| *t != tid);
        log::debug!("reaped {tid} ({}) of {}", thread.name, process.pid);

        if process.is_kernel() || !process.threads.is_empty() {
            return None;
        }
        process.state = ProcessState::Defunct;
        Some((process.pid, process.directory))
    }

    /// Drop a defunct process whose address space is gone.
    pub fn truncate(&mut self, pid: Pid) {
        if let Some(process) = self.get_mut(pid) {
            process.state = ProcessState::Truncate;
        }
        self.processes
            .retain(|p| p.pid != pid || p.state != ProcessState::Truncate);
        log::debug!("{pid} removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_DIR: PhysicalAddress = PhysicalAddress::new(0x1000);

    fn spawn(table: &mut ProcTable<()>, pid: Pid, name: &'static str) -> Tid {
        let tid = table.next_tid();
        table
            .add_thread(pid, Thread::new(tid, name, Some(alloc::boxed::Box::new(()))))
            .unwrap()
    }

    #[test]
    fn single_ready_thread_is_found_every_time() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let a = spawn(&mut table, KERNEL_PID, "a");
        for _ in 0..3 {
            assert_eq!(table.first_ready_thread(), Some(a));
        }
    }

    #[test]
    fn new_threads_go_to_the_head_of_their_process() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let user = table.insert_process("user", PhysicalAddress::new(0x2000));
        let old = spawn(&mut table, user, "old");
        let young = spawn(&mut table, user, "young");
        assert_eq!(table.first_ready_thread(), Some(young));

        // An earlier process wins regardless of age.
        let kernel_thread = spawn(&mut table, KERNEL_PID, "k");
        assert_eq!(table.first_ready_thread(), Some(kernel_thread));

        table.thread_mut(kernel_thread).unwrap().state = ThreadState::Blocked;
        table.thread_mut(young).unwrap().state = ThreadState::Running;
        assert_eq!(table.first_ready_thread(), Some(old));
    }

    #[test]
    fn add_thread_promotes_new_to_ready() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let user = table.insert_process("user", PhysicalAddress::new(0x2000));
        assert_eq!(table.get(user).unwrap().state, ProcessState::New);
        let t = spawn(&mut table, user, "t");
        assert_eq!(table.get(user).unwrap().state, ProcessState::Ready);
        assert_eq!(table.thread(t).unwrap().state, ThreadState::Ready);
        assert_eq!(table.thread(t).unwrap().pid, user);
    }

    #[test]
    fn add_thread_rejects_missing_and_dying_processes() {
        let mut table = ProcTable::<()>::new(KERNEL_DIR);
        let tid = table.next_tid();
        assert_eq!(
            table.add_thread(Pid(42), Thread::new(tid, "x", None)),
            Err(ProcessError::UnknownProcess(Pid(42)))
        );

        let user = table.insert_process("user", PhysicalAddress::new(0x2000));
        table.get_mut(user).unwrap().state = ProcessState::Defunct;
        assert_eq!(
            table.add_thread(user, Thread::new(tid, "x", None)),
            Err(ProcessError::NotAccepting(user))
        );
    }

    #[test]
    fn running_user_process_is_skipped_but_kernel_is_not() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let user = table.insert_process("user", PhysicalAddress::new(0x2000));
        let a = spawn(&mut table, user, "a");
        let b = spawn(&mut table, user, "b");

        let (dir, _) = table.dispatch(b).unwrap();
        assert_eq!(dir, PhysicalAddress::new(0x2000));
        assert_eq!(table.get(user).unwrap().state, ProcessState::Running);
        assert_eq!(table.first_ready_thread(), None);
        assert_eq!(table.thread(a).unwrap().state, ThreadState::Ready);

        let k1 = spawn(&mut table, KERNEL_PID, "k1");
        let k2 = spawn(&mut table, KERNEL_PID, "k2");
        table.dispatch(k2).unwrap();
        assert_eq!(table.get(KERNEL_PID).unwrap().state, ProcessState::Ready);
        assert_eq!(table.first_ready_thread(), Some(k1));

        table.demote(user);
        table.thread_mut(k1).unwrap().state = ThreadState::Blocked;
        assert_eq!(table.first_ready_thread(), Some(a));
    }

    #[test]
    fn scheduler_threads_are_never_selected() {
        let mut table = ProcTable::<()>::new(KERNEL_DIR);
        let sched = table.insert_scheduler_thread("sched0");
        assert_eq!(table.thread(sched).unwrap().state, ThreadState::Scheduler);
        assert_eq!(table.first_ready_thread(), None);
        assert!(table.dispatch(sched).is_none());
        assert_eq!(table.thread(sched).unwrap().state, ThreadState::Scheduler);
    }

    #[test]
    fn notify_follows_table_order() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let channel = WaitChannel::new();
        let first = spawn(&mut table, KERNEL_PID, "first");
        let second = spawn(&mut table, KERNEL_PID, "second");
        table.block(first, channel);
        table.block(second, channel);

        // The younger thread sits at the head of the list and wakes first.
        assert_eq!(table.notify_one(channel), Some(second));
        assert_eq!(table.thread(second).unwrap().state, ThreadState::Ready);
        assert_eq!(table.thread(first).unwrap().state, ThreadState::Blocked);
        assert_eq!(table.notify_one(channel), Some(first));
        assert_eq!(table.notify_one(channel), None);
    }

    #[test]
    fn notify_all_only_touches_its_channel() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let (here, there) = (WaitChannel::new(), WaitChannel::new());
        let a = spawn(&mut table, KERNEL_PID, "a");
        let b = spawn(&mut table, KERNEL_PID, "b");
        let c = spawn(&mut table, KERNEL_PID, "c");
        table.block(a, here);
        table.block(b, here);
        table.block(c, there);

        assert_eq!(table.notify_all(here), 2);
        assert_eq!(table.thread(a).unwrap().state, ThreadState::Ready);
        assert_eq!(table.thread(b).unwrap().state, ThreadState::Ready);
        assert_eq!(table.thread(c).unwrap().state, ThreadState::Blocked);
    }

    #[test]
    fn sleepers_wake_on_their_tick() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let t = spawn(&mut table, KERNEL_PID, "t");
        let thread = table.thread_mut(t).unwrap();
        thread.state = ThreadState::Sleeping;
        thread.slept_at = 10;
        thread.wake_at = 15;

        assert_eq!(table.wake_sleepers(14), 0);
        assert_eq!(table.thread(t).unwrap().state, ThreadState::Sleeping);
        assert_eq!(table.wake_sleepers(15), 1);
        assert_eq!(table.thread(t).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn reaping_the_last_thread_retires_a_user_process() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let dir = PhysicalAddress::new(0x2000);
        let user = table.insert_process("user", dir);
        let a = spawn(&mut table, user, "a");
        let b = spawn(&mut table, user, "b");

        // Only exited threads are reaped.
        assert_eq!(table.reap(a), None);
        assert!(table.thread(a).is_some());

        table.thread_mut(a).unwrap().state = ThreadState::Exited;
        assert_eq!(table.reap(a), None);
        assert!(table.thread(a).is_none());
        assert_eq!(table.get(user).unwrap().threads.len(), 1);

        table.thread_mut(b).unwrap().state = ThreadState::Exited;
        assert_eq!(table.reap(b), Some((user, dir)));
        assert_eq!(table.get(user).unwrap().state, ProcessState::Defunct);

        table.truncate(user);
        assert!(table.get(user).is_none());
    }

    #[test]
    fn kernel_process_outlives_its_threads() {
        let mut table = ProcTable::new(KERNEL_DIR);
        let t = spawn(&mut table, KERNEL_PID, "t");
        table.thread_mut(t).unwrap().state = ThreadState::Exited;
        assert_eq!(table.reap(t), None);
        assert_eq!(table.get(KERNEL_PID).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn thread_ids_are_never_reused() {
        let mut table = ProcTable::<()>::new(KERNEL_DIR);
        let a = table.next_tid();
        let b = table.next_tid();
        assert_ne!(a, b);
        assert!(a.0 > 0);
    }
}
