use gcnsim::gpu::{Gpu, GpuConfig};
use gcnsim::kernel::{CodeObject, Dim3, DispatchPacket};
use gcnsim::placement::PlacementPolicy;
use gcnsim::protocol::{Payload, Pid};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- Kernel dispatch under each placement policy ---
    // 256 work-groups of 256 work-items (4 wavefronts each), with a
    // footprint that lets a few groups share one compute unit.
    let code_object = CodeObject {
        sregs_per_wf: 64,
        vregs_per_lane: 24,
        lds_bytes: 4096,
    };
    let packet = DispatchPacket::new(Dim3::x(256 * 256), Dim3::x(256));

    for policy in [
        PlacementPolicy::RoundRobin,
        PlacementPolicy::Greedy,
        PlacementPolicy::Partition,
    ] {
        let mut gpu = Gpu::new(GpuConfig {
            placement_policy: policy,
            ..GpuConfig::r9_nano()
        })?;
        println!(
            "[gcnsim] R9-Nano-like device: {} CUs, policy {}",
            gpu.num_cus(),
            policy.name(),
        );

        let req = gpu.launch_kernel(Pid(1), code_object, packet, 0x4000, None);
        let cycles = gpu.run_until_idle(1_000_000);

        let responses = gpu.take_driver_responses();
        let completed = responses
            .iter()
            .any(|m| matches!(m.payload, Payload::LaunchKernelRsp { rsp_to } if rsp_to == req));
        println!(
            "[gcnsim]   kernel {}: {} work-groups in {} cycles",
            if completed { "complete" } else { "DID NOT COMPLETE" },
            packet.wg_count().size(),
            cycles,
        );
    }

    // --- Drain protocols on one device ---
    let mut gpu = Gpu::new(GpuConfig::r9_nano())?;

    gpu.flush();
    let cycles = gpu.run_until_idle(100_000);
    report(&mut gpu, "cache flush", cycles);

    gpu.shootdown(Pid(1), vec![0x1000, 0x2000, 0x3000]);
    let cycles = gpu.run_until_idle(100_000);
    report(&mut gpu, "TLB shootdown", cycles);

    gpu.restart(); // bring caches, TLBs, translators, and pipelines back
    let cycles = gpu.run_until_idle(100_000);
    report(&mut gpu, "device restart", cycles);

    gpu.mem_copy_h2d(0x10_0000, 1 << 20);
    let cycles = gpu.run_until_idle(100_000);
    report(&mut gpu, "1 MiB host-to-device copy", cycles);

    gpu.migrate_page(4096, 0x20_0000, 0x30_0000);
    let cycles = gpu.run_until_idle(100_000);
    report(&mut gpu, "page migration", cycles);

    Ok(())
}

fn report(gpu: &mut Gpu, what: &str, cycles: u64) {
    let responses = gpu.take_driver_responses();
    println!(
        "[gcnsim]   {}: {} cycles, {} response(s)",
        what,
        cycles,
        responses.len(),
    );
}
