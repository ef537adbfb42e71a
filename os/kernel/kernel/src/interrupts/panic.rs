use crate::Kernel;
use kernel_arch::Arch;
use kernel_vmem::PhysMapper;

/// Another CPU hit a fatal error and broadcast the panic vector. Stop here
/// rather than keep running on possibly corrupted shared state.
pub fn halt<A: Arch, M: PhysMapper + Send + Sync + 'static>(kernel: &Kernel<A, M>, _vector: u8) {
    let index = kernel.cpus.current().index();
    log::error!("cpu{index} halting: panic on another cpu");
    kernel
        .arch()
        .halt(format_args!("cpu{index} stopped by a panic broadcast"))
}
