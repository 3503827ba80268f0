/// Kernel launch data model.
/// A kernel launch is described by a dispatch packet (grid geometry) and a
/// code-object footprint (register/LDS demand). The grid is broken into
/// work-groups of wavefronts, mirroring the GCN execution model.
use std::fmt;
use std::rc::Rc;

/// Work-items per wavefront on GCN hardware.
pub const WAVEFRONT_SIZE: u32 = 64;

/// 3D dimension struct used for grid and work-group sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    /// Total number of work-items/work-groups in this dimension
    pub fn size(&self) -> u32 {
        self.x * self.y * self.z
    }
}

/// Per-kernel resource footprint declared by the compiled code object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeObject {
    /// Scalar registers needed by each wavefront
    pub sregs_per_wf: u32,
    /// Vector registers needed by each lane (work-item)
    pub vregs_per_lane: u32,
    /// Local data share bytes needed by the whole work-group
    pub lds_bytes: u32,
}

/// Launch geometry: total work-items in the grid and work-items per
/// work-group, per dimension.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPacket {
    pub grid_size: Dim3,
    pub wg_size: Dim3,
}

impl DispatchPacket {
    pub fn new(grid_size: Dim3, wg_size: Dim3) -> Self {
        DispatchPacket { grid_size, wg_size }
    }

    /// Work-groups per dimension, counting partial edge groups.
    pub fn wg_count(&self) -> Dim3 {
        Dim3 {
            x: self.grid_size.x.div_ceil(self.wg_size.x),
            y: self.grid_size.y.div_ceil(self.wg_size.y),
            z: self.grid_size.z.div_ceil(self.wg_size.z),
        }
    }
}

/// Predicate selecting which work-groups of a launch this device runs.
/// Multi-device setups split one grid by giving each device a filter.
#[derive(Clone)]
pub struct WgFilter(Rc<dyn Fn(&DispatchPacket, &WorkGroup) -> bool>);

impl WgFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&DispatchPacket, &WorkGroup) -> bool + 'static,
    {
        WgFilter(Rc::new(f))
    }

    pub fn accepts(&self, packet: &DispatchPacket, wg: &WorkGroup) -> bool {
        (self.0)(packet, wg)
    }
}

impl fmt::Debug for WgFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WgFilter(..)")
    }
}

/// Everything a placement algorithm needs to start walking a kernel's grid.
#[derive(Debug, Clone)]
pub struct KernelLaunchInfo {
    pub code_object: CodeObject,
    pub packet: DispatchPacket,
    pub packet_address: u64,
    pub wg_filter: Option<WgFilter>,
}

/// One work-group: the unit of dispatch. Carries its grid coordinates, its
/// (possibly partial) extent, and a copy of the kernel footprint so the
/// resource ledger never needs to chase the launch request.
#[derive(Debug, Clone)]
pub struct WorkGroup {
    /// Grid-linear index; identifies the work-group within its kernel
    pub flat_id: usize,
    /// Coordinates in the work-group grid
    pub id: Dim3,
    /// Actual work-item extent (smaller than wg_size at grid edges)
    pub cur_size: Dim3,
    /// Wavefronts this work-group dispatches
    pub wavefronts: usize,
    pub code_object: CodeObject,
}

/// Lazy, restartable cursor over a kernel's work-group grid.
/// The grid is never materialized: `next_wg` synthesizes one work-group at a
/// time and `skip` just advances the cursor.
#[derive(Debug, Clone)]
pub struct GridBuilder {
    info: KernelLaunchInfo,
    num_wg: usize,
    xid: u32,
    yid: u32,
    zid: u32,
}

impl GridBuilder {
    pub fn new(info: KernelLaunchInfo) -> Self {
        let mut b = GridBuilder {
            info,
            num_wg: 0,
            xid: 0,
            yid: 0,
            zid: 0,
        };
        b.num_wg = b.count_wg();
        b
    }

    /// Number of work-groups this kernel will dispatch (after filtering).
    pub fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn count_wg(&self) -> usize {
        let dims = self.info.packet.wg_count();
        let filter = match &self.info.wg_filter {
            None => return dims.size() as usize,
            Some(f) => f,
        };

        let mut count = 0;
        for z in 0..dims.z {
            for y in 0..dims.y {
                for x in 0..dims.x {
                    let wg = self.build_wg(x, y, z);
                    if filter.accepts(&self.info.packet, &wg) {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Advance the cursor past the next `n` work-groups.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            if self.next_wg().is_none() {
                break;
            }
        }
    }

    /// Synthesize the next work-group, or None once the grid is exhausted.
    pub fn next_wg(&mut self) -> Option<WorkGroup> {
        let dims = self.info.packet.wg_count();
        loop {
            if self.zid >= dims.z {
                return None;
            }

            let wg = self.build_wg(self.xid, self.yid, self.zid);

            self.xid += 1;
            if self.xid >= dims.x {
                self.xid = 0;
                self.yid += 1;
                if self.yid >= dims.y {
                    self.yid = 0;
                    self.zid += 1;
                }
            }

            match &self.info.wg_filter {
                None => return Some(wg),
                Some(f) if f.accepts(&self.info.packet, &wg) => return Some(wg),
                Some(_) => continue,
            }
        }
    }

    fn build_wg(&self, x: u32, y: u32, z: u32) -> WorkGroup {
        let packet = &self.info.packet;
        let dims = packet.wg_count();

        // Edge work-groups cover only what is left of the grid.
        let cur_size = Dim3 {
            x: (packet.grid_size.x - x * packet.wg_size.x).min(packet.wg_size.x),
            y: (packet.grid_size.y - y * packet.wg_size.y).min(packet.wg_size.y),
            z: (packet.grid_size.z - z * packet.wg_size.z).min(packet.wg_size.z),
        };

        WorkGroup {
            flat_id: (z * dims.y * dims.x + y * dims.x + x) as usize,
            id: Dim3::new(x, y, z),
            cur_size,
            wavefronts: cur_size.size().div_ceil(WAVEFRONT_SIZE) as usize,
            code_object: self.info.code_object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(grid: Dim3, wg: Dim3) -> KernelLaunchInfo {
        KernelLaunchInfo {
            code_object: CodeObject::default(),
            packet: DispatchPacket::new(grid, wg),
            packet_address: 0,
            wg_filter: None,
        }
    }

    #[test]
    fn counts_work_groups_including_partial_edges() {
        // 100 work-items in groups of 64 -> 2 groups, the second partial
        let b = GridBuilder::new(info(Dim3::x(100), Dim3::x(64)));
        assert_eq!(b.num_wg(), 2);
    }

    #[test]
    fn walks_the_grid_in_x_y_z_order() {
        let mut b = GridBuilder::new(info(Dim3::new(128, 128, 2), Dim3::new(64, 64, 1)));
        assert_eq!(b.num_wg(), 8);

        let ids: Vec<Dim3> = std::iter::from_fn(|| b.next_wg()).map(|wg| wg.id).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], Dim3::new(0, 0, 0));
        assert_eq!(ids[1], Dim3::new(1, 0, 0));
        assert_eq!(ids[2], Dim3::new(0, 1, 0));
        assert_eq!(ids[7], Dim3::new(1, 1, 1));

        let mut b2 = GridBuilder::new(info(Dim3::new(128, 128, 2), Dim3::new(64, 64, 1)));
        let got: Vec<usize> = std::iter::from_fn(|| b2.next_wg()).map(|wg| wg.flat_id).collect();
        assert_eq!(got, (0..8).collect::<Vec<usize>>());
    }

    #[test]
    fn partial_edge_group_has_fewer_wavefronts() {
        let mut b = GridBuilder::new(info(Dim3::x(320), Dim3::x(256)));
        let first = b.next_wg().unwrap();
        let second = b.next_wg().unwrap();
        assert_eq!(first.wavefronts, 4);
        assert_eq!(second.cur_size.x, 64);
        assert_eq!(second.wavefronts, 1);
        assert!(b.next_wg().is_none());
    }

    #[test]
    fn skip_advances_the_cursor() {
        let mut b = GridBuilder::new(info(Dim3::x(64 * 6), Dim3::x(64)));
        b.skip(4);
        assert_eq!(b.next_wg().unwrap().flat_id, 4);
        assert_eq!(b.next_wg().unwrap().flat_id, 5);
        assert!(b.next_wg().is_none());
    }

    #[test]
    fn filter_limits_count_and_traversal() {
        let mut launch = info(Dim3::x(64 * 8), Dim3::x(64));
        launch.wg_filter = Some(WgFilter::new(|_, wg| wg.id.x % 2 == 0));
        let mut b = GridBuilder::new(launch);
        assert_eq!(b.num_wg(), 4);

        let ids: Vec<u32> = std::iter::from_fn(|| b.next_wg()).map(|wg| wg.id.x).collect();
        assert_eq!(ids, vec![0, 2, 4, 6]);
    }
}
