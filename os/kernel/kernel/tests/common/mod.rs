//! A booted kernel on the simulated machine.
//!
//! CPU slots `0..cpus` run schedulers once [`Machine::start`] is called. One
//! extra slot, the observer, is attached to the test thread: it built the
//! kernel, has the kernel page tables loaded, and never enters service, so
//! the test can inspect and drive the kernel without being scheduled.

#![allow(dead_code)]

use kernel::Kernel;
use kernel_alloc::phys_mapper::SimRam;
use kernel_arch::sim::Sim;
use kernel_info::boot::BootInfo;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::VmMap;
use std::thread;
use std::time::{Duration, Instant};

pub type TestKernel = Kernel<Sim, SimRam>;

pub const RAM_BASE: u32 = 0x0010_0000;
pub const RAM_FRAMES: usize = 256;

const TIMEOUT: Duration = Duration::from_secs(10);

pub struct Machine {
    pub sim: Sim,
    pub kernel: &'static TestKernel,
    pub cpus: usize,
}

impl Machine {
    /// Build the kernel with `cpus` schedulable CPUs and default handlers,
    /// without sealing the interrupt table.
    pub fn unsealed(cpus: usize) -> Self {
        let apic_ids: Vec<u32> = (0..=cpus).map(|id| u32::try_from(id).unwrap()).collect();
        let sim = Sim::new(&apic_ids);
        sim.attach(cpus);

        let ram = SimRam::new(PhysicalAddress::new(RAM_BASE), RAM_FRAMES);
        let boot = BootInfo::new(&apic_ids, ram.range()).unwrap();
        let kernel = Kernel::new(sim.clone(), &boot, ram, VmMap::standard()).unwrap();
        let kernel: &'static TestKernel = Box::leak(Box::new(kernel));
        kernel.register_default_handlers();
        Self { sim, kernel, cpus }
    }

    /// Build and seal the kernel; the CPUs are not started yet.
    pub fn boot(cpus: usize) -> Self {
        let machine = Self::unsealed(cpus);
        machine.kernel.mark_initialized();
        machine
    }

    /// Put every schedulable CPU into service.
    pub fn start(&self) {
        for slot in 0..self.cpus {
            let kernel = self.kernel;
            // Parked or halted CPUs are never joined.
            drop(self.sim.spawn_cpu(slot, move || {
                kernel.start_cpu();
                kernel.run_scheduler()
            }));
        }
    }

    pub fn wait_until(&self, what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !done() {
            if let Some(fault) = self.sim.fault() {
                panic!("machine halted while waiting for {what}: {fault}");
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Wait for the machine to halt and return its diagnostic.
    pub fn wait_for_fault(&self) -> String {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(fault) = self.sim.fault() {
                return fault;
            }
            assert!(Instant::now() < deadline, "timed out waiting for a fault");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the machine. Must be the test's last interaction with it.
    pub fn power_off(self) {
        self.sim.power_off();
    }
}
