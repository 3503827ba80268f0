/// Per-compute-unit resource ledger.
///
/// A compute unit's scalar registers, per-SIMD vector registers, local data
/// share, and wavefront-pool slots are tracked in allocation-unit masks. A
/// work-group reservation is all-or-nothing: candidate regions are marked
/// `ToReserve` while the search runs, then committed to `Reserved` in one
/// sweep, or rolled back to `Free` if any wavefront cannot be placed.
use std::collections::HashMap;

use thiserror::Error;

use crate::kernel::{CodeObject, WorkGroup};
use crate::port::PortId;

/// Scalar registers per allocation unit.
pub const SREG_GRANULARITY: u32 = 16;
/// Vector registers per lane per allocation unit.
pub const VREG_GRANULARITY: u32 = 4;
/// Lanes per SIMD; one vector allocation unit spans all of them.
pub const VREG_LANES: u32 = 64;
/// LDS bytes per allocation unit.
pub const LDS_GRANULARITY: u32 = 256;
/// Register width in bytes, used to convert unit offsets to byte offsets.
const BYTES_PER_REG: u32 = 4;

/// Allocation state of one resource unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    Free,
    /// Claimed by an in-progress reservation; not yet committed.
    ToReserve,
    Reserved,
}

/// Fixed-length array of allocation-unit states with range scan/set/convert
/// operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMask {
    mask: Vec<AllocStatus>,
}

impl ResourceMask {
    pub fn new(units: usize) -> Self {
        ResourceMask {
            mask: vec![AllocStatus::Free; units],
        }
    }

    /// Find the first run of `length` consecutive units in `status`.
    /// A zero-length request is trivially satisfied at offset 0.
    pub fn next_region(&self, length: usize, status: AllocStatus) -> Option<usize> {
        if length == 0 {
            return Some(0);
        }

        let mut run = 0;
        for (offset, s) in self.mask.iter().enumerate() {
            if *s == status {
                run += 1;
                if run == length {
                    return Some(offset + 1 - run);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Set `length` units starting at `offset` to `status`.
    pub fn set_status(&mut self, offset: usize, length: usize, status: AllocStatus) {
        for s in &mut self.mask[offset..offset + length] {
            *s = status;
        }
    }

    /// Convert every unit in status `from` to status `to`.
    pub fn convert_status(&mut self, from: AllocStatus, to: AllocStatus) {
        for s in &mut self.mask {
            if *s == from {
                *s = to;
            }
        }
    }

    /// Number of units currently in `status`.
    pub fn status_count(&self, status: AllocStatus) -> usize {
        self.mask.iter().filter(|s| **s == status).count()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{resource} count {count} is not a positive multiple of {granularity}")]
    Granularity {
        resource: &'static str,
        count: u32,
        granularity: u32,
    },
    #[error("{0} must be positive")]
    Zero(&'static str),
    #[error("{vreg_files} vector register files declared for {wf_pools} wavefront pools")]
    SimdCountMismatch { vreg_files: usize, wf_pools: usize },
}

/// Resources a compute unit declares when it registers with the command
/// processor.
#[derive(Debug, Clone)]
pub struct CuSpec {
    /// Port the dispatcher sends map-work-group requests to
    pub dispatching_port: PortId,
    /// Wavefront-pool capacity of each SIMD
    pub wf_pool_sizes: Vec<usize>,
    /// Vector register count of each SIMD's register file
    pub vreg_counts: Vec<u32>,
    /// Scalar register count of the whole unit
    pub sreg_count: u32,
    /// LDS capacity in bytes
    pub lds_bytes: u32,
}

/// Where one wavefront of a mapped work-group landed. Offsets are in bytes;
/// the vector-register offset is per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WfSlot {
    pub simd_id: usize,
    pub vreg_offset: u32,
    pub sreg_offset: u32,
    pub lds_offset: u32,
}

struct ReservedWg {
    code_object: CodeObject,
    slots: Vec<WfSlot>,
}

/// The resource ledger of one compute unit.
pub struct CuResource {
    dispatching_port: PortId,
    wf_pool_sizes: Vec<usize>,
    wf_pool_free: Vec<usize>,
    sreg_mask: ResourceMask,
    vreg_masks: Vec<ResourceMask>,
    lds_mask: ResourceMask,
    /// Rotating SIMD scan start; advances on every placement attempt so load
    /// spreads over SIMDs across calls.
    next_simd: usize,
    reserved: HashMap<usize, ReservedWg>,
}

fn granules(amount: u32, granularity: u32) -> usize {
    amount.div_ceil(granularity) as usize
}

fn checked_units(
    resource: &'static str,
    count: u32,
    granularity: u32,
) -> Result<usize, ConfigError> {
    if count == 0 || count % granularity != 0 {
        return Err(ConfigError::Granularity {
            resource,
            count,
            granularity,
        });
    }
    Ok((count / granularity) as usize)
}

impl CuResource {
    pub fn new(spec: &CuSpec) -> Result<Self, ConfigError> {
        if spec.wf_pool_sizes.is_empty() {
            return Err(ConfigError::Zero("wavefront pool count"));
        }
        if spec.wf_pool_sizes.iter().any(|&n| n == 0) {
            return Err(ConfigError::Zero("wavefront pool size"));
        }
        if spec.vreg_counts.len() != spec.wf_pool_sizes.len() {
            return Err(ConfigError::SimdCountMismatch {
                vreg_files: spec.vreg_counts.len(),
                wf_pools: spec.wf_pool_sizes.len(),
            });
        }

        let sreg_units = checked_units("scalar register", spec.sreg_count, SREG_GRANULARITY)?;
        let lds_units = checked_units("LDS byte", spec.lds_bytes, LDS_GRANULARITY)?;
        let vreg_masks = spec
            .vreg_counts
            .iter()
            .map(|&count| {
                checked_units("vector register", count, VREG_GRANULARITY * VREG_LANES)
                    .map(ResourceMask::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CuResource {
            dispatching_port: spec.dispatching_port,
            wf_pool_sizes: spec.wf_pool_sizes.clone(),
            wf_pool_free: spec.wf_pool_sizes.clone(),
            sreg_mask: ResourceMask::new(sreg_units),
            vreg_masks,
            lds_mask: ResourceMask::new(lds_units),
            next_simd: 0,
            reserved: HashMap::new(),
        })
    }

    pub fn dispatching_port(&self) -> PortId {
        self.dispatching_port
    }

    pub fn wf_slots_total(&self) -> usize {
        self.wf_pool_sizes.iter().sum()
    }

    pub fn wf_slots_free(&self) -> usize {
        self.wf_pool_free.iter().sum()
    }

    pub fn reserved_wg_count(&self) -> usize {
        self.reserved.len()
    }

    /// Try to reserve everything `wg` needs. Returns the committed wavefront
    /// locations, or None with the ledger untouched.
    pub fn reserve(&mut self, wg: &WorkGroup) -> Option<Vec<WfSlot>> {
        let mut slots = vec![WfSlot::default(); wg.wavefronts];

        let ok = self.within_sreg_limit(wg, &mut slots)
            && self.within_lds_limit(wg, &mut slots)
            && self.match_wfs_with_simds(wg, &mut slots);

        if !ok {
            self.clear_temp_reservation();
            return None;
        }

        self.commit(wg, &slots);
        Some(slots)
    }

    /// Find a scalar-register region for every wavefront.
    fn within_sreg_limit(&mut self, wg: &WorkGroup, slots: &mut [WfSlot]) -> bool {
        let required = granules(wg.code_object.sregs_per_wf, SREG_GRANULARITY);

        for slot in slots.iter_mut() {
            let Some(offset) = self.sreg_mask.next_region(required, AllocStatus::Free) else {
                return false;
            };
            slot.sreg_offset = offset as u32 * SREG_GRANULARITY * BYTES_PER_REG;
            self.sreg_mask
                .set_status(offset, required, AllocStatus::ToReserve);
        }

        true
    }

    /// Find one LDS region shared by the whole work-group.
    fn within_lds_limit(&mut self, wg: &WorkGroup, slots: &mut [WfSlot]) -> bool {
        let required = granules(wg.code_object.lds_bytes, LDS_GRANULARITY);
        let Some(offset) = self.lds_mask.next_region(required, AllocStatus::Free) else {
            return false;
        };

        for slot in slots.iter_mut() {
            slot.lds_offset = offset as u32 * LDS_GRANULARITY;
        }

        self.lds_mask
            .set_status(offset, required, AllocStatus::ToReserve);
        true
    }

    /// Match each wavefront with a SIMD that has both a vector-register
    /// region and a wavefront-pool slot left. The scan starts at the rotating
    /// pointer and walks all SIMDs circularly; the pointer advances on every
    /// attempt, found or not.
    fn match_wfs_with_simds(&mut self, wg: &WorkGroup, slots: &mut [WfSlot]) -> bool {
        let num_simds = self.wf_pool_free.len();
        let mut pool_claimed = vec![0usize; num_simds];
        let required = granules(wg.code_object.vregs_per_lane, VREG_GRANULARITY);

        for slot in slots.iter_mut() {
            let first_simd_tested = self.next_simd;
            let mut first_try = true;
            let mut found = false;

            while first_try || self.next_simd != first_simd_tested {
                first_try = false;
                let simd = self.next_simd;

                let offset = self.vreg_masks[simd].next_region(required, AllocStatus::Free);
                if let Some(offset) = offset {
                    if self.wf_pool_free[simd] - pool_claimed[simd] > 0 {
                        found = true;
                        pool_claimed[simd] += 1;
                        slot.simd_id = simd;
                        slot.vreg_offset = offset as u32 * VREG_GRANULARITY * BYTES_PER_REG;
                        self.vreg_masks[simd].set_status(offset, required, AllocStatus::ToReserve);
                    }
                }

                self.next_simd = (self.next_simd + 1) % num_simds;

                if found {
                    break;
                }
            }

            if !found {
                return false;
            }
        }

        true
    }

    fn commit(&mut self, wg: &WorkGroup, slots: &[WfSlot]) {
        for slot in slots {
            self.wf_pool_free[slot.simd_id] -= 1;
        }

        self.sreg_mask
            .convert_status(AllocStatus::ToReserve, AllocStatus::Reserved);
        self.lds_mask
            .convert_status(AllocStatus::ToReserve, AllocStatus::Reserved);
        for mask in &mut self.vreg_masks {
            mask.convert_status(AllocStatus::ToReserve, AllocStatus::Reserved);
        }

        if self
            .reserved
            .insert(
                wg.flat_id,
                ReservedWg {
                    code_object: wg.code_object,
                    slots: slots.to_vec(),
                },
            )
            .is_some()
        {
            panic!("work-group {} reserved twice", wg.flat_id);
        }
    }

    fn clear_temp_reservation(&mut self) {
        self.sreg_mask
            .convert_status(AllocStatus::ToReserve, AllocStatus::Free);
        self.lds_mask
            .convert_status(AllocStatus::ToReserve, AllocStatus::Free);
        for mask in &mut self.vreg_masks {
            mask.convert_status(AllocStatus::ToReserve, AllocStatus::Free);
        }
    }

    /// Release everything a mapped work-group held. The granule counts are
    /// recomputed from the recorded footprint, so release restores exactly
    /// what reservation took.
    pub fn free(&mut self, wg_flat_id: usize) {
        let Some(entry) = self.reserved.remove(&wg_flat_id) else {
            panic!("freeing work-group {wg_flat_id}, which holds no reservation");
        };

        let co = entry.code_object;
        for slot in &entry.slots {
            self.wf_pool_free[slot.simd_id] += 1;

            let lds_units = granules(co.lds_bytes, LDS_GRANULARITY);
            self.lds_mask.set_status(
                (slot.lds_offset / LDS_GRANULARITY) as usize,
                lds_units,
                AllocStatus::Free,
            );

            let sreg_units = granules(co.sregs_per_wf, SREG_GRANULARITY);
            self.sreg_mask.set_status(
                (slot.sreg_offset / BYTES_PER_REG / SREG_GRANULARITY) as usize,
                sreg_units,
                AllocStatus::Free,
            );

            let vreg_units = granules(co.vregs_per_lane, VREG_GRANULARITY);
            self.vreg_masks[slot.simd_id].set_status(
                (slot.vreg_offset / BYTES_PER_REG / VREG_GRANULARITY) as usize,
                vreg_units,
                AllocStatus::Free,
            );
        }
    }
}

/// All registered compute units' ledgers, indexed by registration order.
#[derive(Default)]
pub struct CuResourcePool {
    cus: Vec<CuResource>,
}

impl CuResourcePool {
    pub fn new() -> Self {
        CuResourcePool::default()
    }

    /// Register a compute unit's resources. Re-registering the same
    /// dispatching port is a no-op.
    pub fn register_cu(&mut self, spec: &CuSpec) -> Result<(), ConfigError> {
        if self
            .cus
            .iter()
            .any(|cu| cu.dispatching_port == spec.dispatching_port)
        {
            return Ok(());
        }

        self.cus.push(CuResource::new(spec)?);
        Ok(())
    }

    pub fn num_cus(&self) -> usize {
        self.cus.len()
    }

    pub fn cu(&self, i: usize) -> &CuResource {
        &self.cus[i]
    }

    pub fn cu_mut(&mut self, i: usize) -> &mut CuResource {
        &mut self.cus[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Dim3;

    fn test_spec(port: PortId) -> CuSpec {
        CuSpec {
            dispatching_port: port,
            wf_pool_sizes: vec![10, 10, 10, 10],
            vreg_counts: vec![16384; 4],
            sreg_count: 3200,
            lds_bytes: 65536,
        }
    }

    fn port() -> PortId {
        let mut fabric = crate::port::Fabric::new();
        fabric.add_port("cu", 1)
    }

    fn wg(flat_id: usize, wavefronts: usize, co: CodeObject) -> WorkGroup {
        WorkGroup {
            flat_id,
            id: Dim3::x(flat_id as u32),
            cur_size: Dim3::x(wavefronts as u32 * 64),
            wavefronts,
            code_object: co,
        }
    }

    fn snapshot(cu: &CuResource) -> (Vec<usize>, usize, usize, Vec<usize>) {
        (
            cu.wf_pool_free.clone(),
            cu.sreg_mask.status_count(AllocStatus::Free),
            cu.lds_mask.status_count(AllocStatus::Free),
            cu.vreg_masks
                .iter()
                .map(|m| m.status_count(AllocStatus::Free))
                .collect(),
        )
    }

    #[test]
    fn mask_finds_first_fit_run() {
        let mut mask = ResourceMask::new(8);
        mask.set_status(0, 2, AllocStatus::Reserved);
        mask.set_status(3, 1, AllocStatus::Reserved);

        assert_eq!(mask.next_region(1, AllocStatus::Free), Some(2));
        assert_eq!(mask.next_region(3, AllocStatus::Free), Some(4));
        assert_eq!(mask.next_region(5, AllocStatus::Free), None);
        assert_eq!(mask.next_region(0, AllocStatus::Free), Some(0));
    }

    #[test]
    fn mask_converts_only_matching_units() {
        let mut mask = ResourceMask::new(4);
        mask.set_status(1, 2, AllocStatus::ToReserve);
        mask.convert_status(AllocStatus::ToReserve, AllocStatus::Reserved);

        assert_eq!(mask.status_count(AllocStatus::Reserved), 2);
        assert_eq!(mask.status_count(AllocStatus::Free), 2);
    }

    #[test]
    fn reserve_then_free_restores_every_count() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let before = snapshot(&cu);

        let co = CodeObject {
            sregs_per_wf: 64,
            vregs_per_lane: 32,
            lds_bytes: 4096,
        };
        let slots = cu.reserve(&wg(0, 4, co)).unwrap();
        assert_eq!(slots.len(), 4);
        assert_ne!(snapshot(&cu), before);

        cu.free(0);
        assert_eq!(snapshot(&cu), before);
        assert_eq!(cu.reserved_wg_count(), 0);
    }

    #[test]
    fn wavefronts_spread_over_simds_via_rotating_pointer() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let co = CodeObject {
            sregs_per_wf: 16,
            vregs_per_lane: 4,
            lds_bytes: 256,
        };

        let slots = cu.reserve(&wg(0, 4, co)).unwrap();
        let simds: Vec<usize> = slots.iter().map(|s| s.simd_id).collect();
        assert_eq!(simds, vec![0, 1, 2, 3]);

        // The pointer persisted past the last placement, so the next
        // work-group starts where the previous one left off.
        let slots = cu.reserve(&wg(1, 2, co)).unwrap();
        let simds: Vec<usize> = slots.iter().map(|s| s.simd_id).collect();
        assert_eq!(simds, vec![0, 1]);
    }

    #[test]
    fn sreg_exhaustion_fails_without_touching_any_mask() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let before = snapshot(&cu);

        // 3200 scalar registers total; 2 wavefronts * 1696 regs do not fit.
        let co = CodeObject {
            sregs_per_wf: 1696,
            vregs_per_lane: 4,
            lds_bytes: 256,
        };
        assert!(cu.reserve(&wg(0, 2, co)).is_none());
        assert_eq!(snapshot(&cu), before);
    }

    #[test]
    fn lds_exhaustion_fails_without_touching_any_mask() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let before = snapshot(&cu);

        let co = CodeObject {
            sregs_per_wf: 16,
            vregs_per_lane: 4,
            lds_bytes: 65536 + 1 - 256, // rounds up past capacity only when combined
        };
        // First group takes most of the LDS; the second cannot fit.
        assert!(cu.reserve(&wg(0, 1, co)).is_some());
        let held = snapshot(&cu);
        assert!(cu.reserve(&wg(1, 1, co)).is_none());
        assert_eq!(snapshot(&cu), held);
    }

    #[test]
    fn vreg_exhaustion_on_every_simd_fails_atomically() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let before = snapshot(&cu);

        // 16384 vregs per SIMD = 256 per lane; 260 never fits anywhere.
        let co = CodeObject {
            sregs_per_wf: 16,
            vregs_per_lane: 260,
            lds_bytes: 256,
        };
        assert!(cu.reserve(&wg(0, 1, co)).is_none());
        assert_eq!(snapshot(&cu), before);
    }

    #[test]
    fn pool_slot_exhaustion_fails_atomically() {
        let spec = CuSpec {
            wf_pool_sizes: vec![1],
            vreg_counts: vec![16384],
            ..test_spec(port())
        };
        let mut cu = CuResource::new(&spec).unwrap();
        let co = CodeObject {
            sregs_per_wf: 16,
            vregs_per_lane: 4,
            lds_bytes: 256,
        };

        // Two wavefronts, one pool slot: the second wavefront has vector
        // registers available but no slot, so the whole group fails.
        let before = snapshot(&cu);
        assert!(cu.reserve(&wg(0, 2, co)).is_none());
        assert_eq!(snapshot(&cu), before);
    }

    #[test]
    fn zero_size_requests_are_trivially_satisfied() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let co = CodeObject::default();

        let slots = cu.reserve(&wg(0, 1, co)).unwrap();
        assert_eq!(slots[0].sreg_offset, 0);
        assert_eq!(slots[0].lds_offset, 0);
        cu.free(0);
    }

    #[test]
    fn offsets_are_byte_addressed() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        let co = CodeObject {
            sregs_per_wf: 32, // 2 scalar units
            vregs_per_lane: 8, // 2 vector units
            lds_bytes: 512,   // 2 LDS units
        };

        let a = cu.reserve(&wg(0, 1, co)).unwrap();
        let b = cu.reserve(&wg(1, 1, co)).unwrap();
        assert_eq!(a[0].sreg_offset, 0);
        // Second group starts 32 registers (128 bytes) into the scalar file.
        assert_eq!(b[0].sreg_offset, 128);
        assert_eq!(b[0].lds_offset, 512);
        // Wavefront 1 landed on SIMD 1 (rotating pointer), so its vector
        // offset is measured within that file and starts at 0.
        assert_eq!(b[0].simd_id, 1);
        assert_eq!(b[0].vreg_offset, 0);
    }

    #[test]
    #[should_panic(expected = "holds no reservation")]
    fn freeing_an_unknown_work_group_is_fatal() {
        let mut cu = CuResource::new(&test_spec(port())).unwrap();
        cu.free(42);
    }

    #[test]
    fn config_errors_are_rejected_at_construction() {
        let mut spec = test_spec(port());
        spec.sreg_count = 100; // not a multiple of 16
        assert!(matches!(
            CuResource::new(&spec),
            Err(ConfigError::Granularity { .. })
        ));

        let mut spec = test_spec(port());
        spec.vreg_counts.pop();
        assert!(matches!(
            CuResource::new(&spec),
            Err(ConfigError::SimdCountMismatch { .. })
        ));

        let mut spec = test_spec(port());
        spec.lds_bytes = 0;
        assert!(CuResource::new(&spec).is_err());
    }

    #[test]
    fn pool_ignores_duplicate_registration() {
        let p = port();
        let mut pool = CuResourcePool::new();
        pool.register_cu(&test_spec(p)).unwrap();
        pool.register_cu(&test_spec(p)).unwrap();
        assert_eq!(pool.num_cus(), 1);
    }
}
