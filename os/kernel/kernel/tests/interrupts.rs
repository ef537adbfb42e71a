mod common;

use common::{Machine, TestKernel};
use kernel_arch::{PANIC_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR, TLB_SHOOTDOWN_VECTOR};

fn noop(_kernel: &TestKernel, _vector: u8) {}

#[test]
fn default_handlers_cover_the_kernel_vectors() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    for vector in [TIMER_VECTOR, TLB_SHOOTDOWN_VECTOR, PANIC_VECTOR, SPURIOUS_VECTOR] {
        assert!(kernel.handler(vector).is_some(), "vector {vector:#04x}");
    }
    assert!(kernel.handler(0x40).is_none());
    assert!(kernel.is_initialized());
}

#[test]
fn handlers_can_be_added_before_initialization() {
    let machine = Machine::unsealed(1);
    machine.kernel.set_handler(0x40, noop);
    assert!(machine.kernel.handler(0x40).is_some());
    assert!(!machine.kernel.is_initialized());
}

#[test]
#[should_panic(expected = "handler for vector 0x40 set after initialization")]
fn set_handler_after_initialization_is_fatal() {
    let machine = Machine::boot(1);
    machine.kernel.set_handler(0x40, noop);
}

#[test]
#[should_panic(expected = "start_cpu before the kernel is initialized")]
fn start_cpu_before_initialization_is_fatal() {
    let machine = Machine::unsealed(1);
    machine.kernel.start_cpu();
}

#[test]
fn timer_ticks_are_counted_and_acknowledged() {
    let machine = Machine::boot(2);
    let kernel = machine.kernel;
    machine.start();
    machine.wait_until("both cpus active", || kernel.cpus().active_count() == 2);

    for _ in 0..3 {
        machine.sim.raise_interrupt(0, TIMER_VECTOR);
    }
    // Only the first cpu counts.
    machine.sim.raise_interrupt(1, TIMER_VECTOR);
    machine.wait_until("three ticks", || kernel.ticks() == 3);
    machine.wait_until("four acknowledgements", || {
        machine.sim.eoi_count(0) == 3 && machine.sim.eoi_count(1) == 1
    });
    assert_eq!(kernel.ticks(), 3);

    machine.power_off();
}

#[test]
fn spurious_interrupts_are_not_acknowledged() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    machine.start();
    machine.wait_until("cpu active", || kernel.cpus().active_count() == 1);

    machine.sim.raise_interrupt(0, SPURIOUS_VECTOR);
    machine.sim.raise_interrupt(0, TIMER_VECTOR);
    machine.wait_until("the tick", || kernel.ticks() == 1);
    machine.wait_until("one acknowledgement", || machine.sim.eoi_count(0) == 1);
    assert_eq!(machine.sim.eoi_count(0), 1);

    machine.power_off();
}

#[test]
fn an_unregistered_vector_halts_the_machine() {
    let machine = Machine::boot(1);
    let kernel = machine.kernel;
    machine.start();
    machine.wait_until("cpu active", || kernel.cpus().active_count() == 1);

    machine.sim.raise_interrupt(0, 0x40);
    let fault = machine.wait_for_fault();
    assert!(fault.contains("no handler for vector 0x40"), "{fault}");
    assert!(machine.sim.is_halted());
}

#[test]
fn outside_an_interrupt_handler_in_interrupt_is_clear() {
    let machine = Machine::boot(1);
    assert!(!machine.kernel.in_interrupt());
    assert_eq!(machine.kernel.current_thread(), None);
}

#[test]
fn a_panic_broadcast_halts_the_receiving_cpu() {
    let machine = Machine::boot(2);
    let kernel = machine.kernel;
    machine.start();
    machine.wait_until("both cpus active", || kernel.cpus().active_count() == 2);

    machine.sim.raise_interrupt(1, PANIC_VECTOR);
    let fault = machine.wait_for_fault();
    assert!(fault.contains("cpu1 stopped by a panic broadcast"), "{fault}");
    assert!(machine.sim.is_halted());
}

#[test]
fn a_fatal_error_signals_every_other_cpu() {
    let machine = Machine::boot(2);
    let kernel = machine.kernel;

    let cpu0 = machine
        .sim
        .spawn_cpu(0, move || kernel.cpus().fatal(format_args!("disk on fire")));
    assert!(cpu0.join().is_err());
    assert!(machine.wait_for_fault().starts_with("disk on fire ("));

    assert!(machine.sim.pending_interrupts(0).is_empty());
    // The second cpu and the observer.
    for slot in 1..=2 {
        assert_eq!(machine.sim.pending_interrupts(slot), [PANIC_VECTOR], "cpu{slot}");
    }
}
