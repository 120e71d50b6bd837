//! In-memory topology: disks, RAID devices, and the (possibly stacked) RAID set tree.
//!
//! Everything is held in a [`Topology`] arena and referenced by small index
//! newtypes rather than pointers, so the tree is plain data: no lifetimes,
//! no `Rc`/`Weak` bookkeeping, and `Drop` handles teardown for free.

use std::path::PathBuf;

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};

use crate::format::dos_partition::PartitionPrivate;
use crate::format::{asr::AsrPrivate, ddf1::Ddf1Private, isw::IswPrivate, pdc::PdcPrivate};

/// Index of a [`DiskInfo`] in a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskId(pub usize);

/// Index of a [`RaidDev`] in a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevId(pub usize);

/// Index of a [`RaidSet`] in a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetId(pub usize);

/// Unified RAID level, vendor concepts mapped onto a single closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnifiedType {
    Undef,
    Group,
    Partition,
    Spare,
    Linear,
    Raid0,
    Raid1,
    Raid4,
    Raid5Ls,
    Raid5Rs,
    Raid5La,
    Raid5Ra,
    Raid6,
}

impl UnifiedType {
    /// Display string used in listings (`dmraid -s`-style output).
    pub fn display_name(self) -> &'static str {
        match self {
            UnifiedType::Undef => "undef",
            UnifiedType::Group => "GROUP",
            UnifiedType::Partition => "partition",
            UnifiedType::Spare => "spare",
            UnifiedType::Linear => "linear",
            UnifiedType::Raid0 => "stripe",
            UnifiedType::Raid1 => "mirror",
            UnifiedType::Raid4 => "raid4",
            UnifiedType::Raid5Ls => "raid5_ls",
            UnifiedType::Raid5Rs => "raid5_rs",
            UnifiedType::Raid5La => "raid5_la",
            UnifiedType::Raid5Ra => "raid5_ra",
            UnifiedType::Raid6 => "raid6",
        }
    }

    /// DM target keyword this type maps onto, if any.
    pub fn dm_target(self) -> Option<&'static str> {
        match self {
            UnifiedType::Linear => Some("linear"),
            UnifiedType::Raid0 => Some("striped"),
            UnifiedType::Raid1 => Some("mirror"),
            UnifiedType::Raid4
            | UnifiedType::Raid5Ls
            | UnifiedType::Raid5Rs
            | UnifiedType::Raid5La
            | UnifiedType::Raid5Ra => Some("raid45"),
            _ => None,
        }
    }

    pub fn is_raid5(self) -> bool {
        matches!(
            self,
            UnifiedType::Raid5Ls | UnifiedType::Raid5Rs | UnifiedType::Raid5La | UnifiedType::Raid5Ra
        )
    }
}

/// Unified per-device/per-set status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnifiedStatus {
    Undef,
    Setup,
    Broken,
    Inconsistent,
    NoSync,
    Ok,
}

impl UnifiedStatus {
    pub fn display_name(self) -> &'static str {
        match self {
            UnifiedStatus::Undef => "undef",
            UnifiedStatus::Setup => "setup",
            UnifiedStatus::Broken => "broken",
            UnifiedStatus::Inconsistent => "inconsistent",
            UnifiedStatus::NoSync => "nosync",
            UnifiedStatus::Ok => "ok",
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, UnifiedStatus::Ok)
    }

    pub fn is_broken(self) -> bool {
        matches!(self, UnifiedStatus::Broken)
    }

    /// `sync` vs `nosync` argument for the kernel mirror/raid45 targets.
    pub fn dm_sync_arg(self) -> &'static str {
        match self {
            UnifiedStatus::Inconsistent | UnifiedStatus::NoSync => "nosync",
            _ => "sync",
        }
    }
}

/// Flags carried on a [`RaidSet`].
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetFlag {
    /// This set has had a partition pass run over it and owns partition children.
    HasPartitions,
    /// The format plug-in wants a maximized (multi-segment) RAID0 mapping
    /// rather than abandoning the extra capacity of larger members.
    Maximize,
}

pub type SetFlags = BitFlags<SetFlag>;

/// Identity of a physical (or, in the partition pass, DM-synthesised) block device.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub path: PathBuf,
    pub sectors: u64,
    pub serial: Option<String>,
    /// Set only for the synthetic "disk" the partition pass (§4.6) builds over
    /// an already-active top-level set's DM node. Carries the set id so the
    /// `dos_partition` plug-in's `group()` knows which set to graft partition
    /// children under, without a mutable flag on shared state (Open Question b).
    pub partition_parent: Option<SetId>,
}

/// One contiguous on-disk byte range holding a vendor metadata structure, plus
/// the bytes last read from (or about to be written to) it.
#[derive(Debug, Clone)]
pub struct MetaArea {
    /// Offset from the start of the device, in sectors.
    pub offset: u64,
    /// Size in bytes.
    pub size: usize,
    /// In-memory copy of the region, kept around so writes can be re-serialised
    /// and so the reconfig log (§4.5) can snapshot it for revert.
    pub data: Vec<u8>,
}

/// The opaque per-device "private" payload, tagged by format so each plug-in's
/// parsed structure has a single concrete type instead of a void pointer.
#[derive(Debug, Clone)]
pub enum RaidDevPrivate {
    Isw(IswPrivate),
    Asr(AsrPrivate),
    Ddf1(Ddf1Private),
    Pdc(PdcPrivate),
    Partition(PartitionPrivate),
    None,
}

/// One vendor-described member view of a disk.
#[derive(Debug, Clone)]
pub struct RaidDev {
    pub disk: DiskId,
    /// Name of the owning format plug-in, looked up in the [`crate::format::FormatRegistry`].
    pub format: &'static str,
    pub private: RaidDevPrivate,
    pub meta_areas: Vec<MetaArea>,
    /// Start of member data, in sectors, relative to the disk.
    pub offset: u64,
    /// Length of member data, in sectors.
    pub sectors: u64,
    pub ty: UnifiedType,
    pub status: UnifiedStatus,
    pub name: String,
}

impl RaidDev {
    pub fn is_spare(&self) -> bool {
        self.ty == UnifiedType::Spare
    }
}

/// Node in the (possibly stacked) RAID set tree.
#[derive(Debug, Clone)]
pub struct RaidSet {
    pub name: String,
    pub ty: UnifiedType,
    pub status: UnifiedStatus,
    /// Name of the owning format plug-in, so the grouper knows whose `check()`
    /// to run on this set (§4.3).
    pub format: &'static str,
    /// Stripe chunk size in sectors; zero when not applicable.
    pub stride: u64,
    pub parent: Option<SetId>,
    pub children: Vec<SetId>,
    pub devs: Vec<DevId>,
    pub flags: SetFlags,
}

impl RaidSet {
    fn new(name: String, ty: UnifiedType, format: &'static str) -> Self {
        RaidSet {
            name,
            ty,
            status: UnifiedStatus::Setup,
            format,
            stride: 0,
            parent: None,
            children: Vec::new(),
            devs: Vec::new(),
            flags: SetFlags::empty(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.ty == UnifiedType::Group
    }

    pub fn is_spare(&self) -> bool {
        self.ty == UnifiedType::Spare
    }

    pub fn is_stacked(&self) -> bool {
        !self.is_group() && !self.children.is_empty()
    }
}

/// Arena of disks, devices and sets making up one invocation's world.
///
/// Top-level sets are those with `parent == None`; walk `set(id).children`
/// to descend a stack, or `roots` for the whole forest.
#[derive(Debug, Default)]
pub struct Topology {
    disks: Vec<DiskInfo>,
    devs: Vec<RaidDev>,
    sets: Vec<RaidSet>,
    pub roots: Vec<SetId>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    pub fn add_disk(&mut self, disk: DiskInfo) -> DiskId {
        self.disks.push(disk);
        DiskId(self.disks.len() - 1)
    }

    pub fn disk(&self, id: DiskId) -> &DiskInfo {
        &self.disks[id.0]
    }

    pub fn disks(&self) -> impl Iterator<Item = (DiskId, &DiskInfo)> {
        self.disks.iter().enumerate().map(|(i, d)| (DiskId(i), d))
    }

    pub fn add_dev(&mut self, dev: RaidDev) -> DevId {
        self.devs.push(dev);
        DevId(self.devs.len() - 1)
    }

    pub fn dev(&self, id: DevId) -> &RaidDev {
        &self.devs[id.0]
    }

    pub fn dev_mut(&mut self, id: DevId) -> &mut RaidDev {
        &mut self.devs[id.0]
    }

    pub fn devs(&self) -> impl Iterator<Item = (DevId, &RaidDev)> {
        self.devs.iter().enumerate().map(|(i, d)| (DevId(i), d))
    }

    /// Allocate a new top-level (or child, via `parent`) set, or return the id
    /// of an existing one reachable under `search_root` with the same name.
    ///
    /// Mirrors `find_or_alloc_raid_set()`: name-based dedup is how siblings
    /// on different disks converge on the same set during grouping.
    pub fn find_or_alloc_set(
        &mut self,
        name: &str,
        search_root: Option<SetId>,
        ty: UnifiedType,
        format: &'static str,
    ) -> SetId {
        if let Some(id) = self.find_set(name, search_root) {
            return id;
        }

        self.sets.push(RaidSet::new(name.to_string(), ty, format));
        let id = SetId(self.sets.len() - 1);

        match search_root {
            Some(parent) => self.link_child(parent, id),
            None => self.roots.push(id),
        }

        id
    }

    /// Search for a set by name, either globally (`search_root = None`,
    /// top-level sets only) or recursively under a given root.
    pub fn find_set(&self, name: &str, search_root: Option<SetId>) -> Option<SetId> {
        match search_root {
            None => self.roots.iter().copied().find(|id| self.set(*id).name == name),
            Some(root) => self.find_set_under(name, root),
        }
    }

    /// Search every root's subtree for a set named `name`, for callers (the
    /// reconfig CLI path) that don't already know which top-level set a
    /// nested mirror lives under.
    pub fn find_set_anywhere(&self, name: &str) -> Option<SetId> {
        self.roots.iter().find_map(|&r| self.find_set_under(name, r))
    }

    fn find_set_under(&self, name: &str, root: SetId) -> Option<SetId> {
        if self.set(root).name == name {
            return Some(root);
        }

        self.set(root)
            .children
            .iter()
            .find_map(|&child| self.find_set_under(name, child))
    }

    /// Reparent a set that was allocated as a (possibly temporary) root into
    /// a stacked parent, mirroring `join_superset()`: a lower-level set
    /// (e.g. one RAID1 leg of a RAID10) is found or created on its own
    /// first, then grafted under the top-level set once that's known.
    pub fn promote_to_child(&mut self, parent: SetId, child: SetId) {
        if self.sets[child.0].parent == Some(parent) {
            return;
        }
        self.roots.retain(|&r| r != child);
        self.link_child(parent, child);
    }

    pub fn link_child(&mut self, parent: SetId, child: SetId) {
        self.sets[child.0].parent = Some(parent);
        if !self.sets[parent.0].children.contains(&child) {
            self.sets[parent.0].children.push(child);
        }
    }

    pub fn attach_dev(&mut self, set: SetId, dev: DevId) {
        self.sets[set.0].devs.push(dev);
    }

    pub fn set(&self, id: SetId) -> &RaidSet {
        &self.sets[id.0]
    }

    pub fn set_mut(&mut self, id: SetId) -> &mut RaidSet {
        &mut self.sets[id.0]
    }

    pub fn sets(&self) -> impl Iterator<Item = (SetId, &RaidSet)> {
        self.sets.iter().enumerate().map(|(i, s)| (SetId(i), s))
    }

    /// Drop a child set/device from its parent's list without freeing the
    /// arena slot (mirrors `check()` dropping an unrecoverable child).
    pub fn unlink_child(&mut self, parent: SetId, child: SetId) {
        self.sets[parent.0].children.retain(|&c| c != child);
    }

    pub fn unlink_dev(&mut self, set: SetId, dev: DevId) {
        self.sets[set.0].devs.retain(|&d| d != dev);
    }

    /// Total sector count of a set, computed bottom-up per §3:
    /// mirrors take the minimum (stride-floored), stripes sum, RAID4/5
    /// subtract one member's worth, RAID6 subtracts two.
    pub fn total_sectors(&self, id: SetId) -> u64 {
        let set = self.set(id);
        let mut sectors: u64 = 0;
        let stride = set.stride;
        let maximize = set.flags.contains(SetFlag::Maximize);

        let add = |sectors: u64, amount: u64| -> u64 {
            let amount = if stride > 0 {
                amount / stride * stride
            } else {
                amount
            };
            if set.ty == UnifiedType::Raid1 {
                if sectors == 0 || sectors > amount {
                    amount
                } else {
                    sectors
                }
            } else {
                sectors + amount
            }
        };

        if !set.is_group() {
            for &child in &set.children {
                sectors = add(sectors, self.total_sectors(child));
            }
        }

        if !set.devs.is_empty() {
            let smallest = set
                .devs
                .iter()
                .map(|&d| self.dev(d))
                .filter(|d| !d.is_spare())
                .map(|d| d.sectors)
                .min()
                .unwrap_or(0);

            for &dev_id in &set.devs {
                let dev = self.dev(dev_id);
                if dev.is_spare() {
                    continue;
                }
                let amount = if maximize { dev.sectors } else { smallest };
                sectors = add(sectors, amount);
            }
        }

        if set.ty == UnifiedType::Raid4 || set.ty.is_raid5() || set.ty == UnifiedType::Raid6 {
            let subsets = self.count_subsets(id);
            let divisor = if subsets > 0 {
                subsets
            } else {
                self.count_devs(id, CountKind::NonSpare)
            }
            .max(1) as u64;

            let sub = sectors / divisor;
            sectors -= sub;
            if set.ty == UnifiedType::Raid6 {
                sectors -= sub;
            }
        }

        sectors
    }

    fn count_subsets(&self, id: SetId) -> usize {
        self.set(id).children.len()
    }

    /// Count member devices recursively, matching `count_devs()`.
    pub fn count_devs(&self, id: SetId, kind: CountKind) -> usize {
        let set = self.set(id);
        let mut count = 0;

        if !set.is_group() {
            for &child in &set.children {
                count += self.count_devs(child, kind);
            }
        }

        for &dev_id in &set.devs {
            let dev = self.dev(dev_id);
            let matches = match kind {
                CountKind::NonSpare => !dev.is_spare(),
                CountKind::Spare => dev.is_spare(),
                CountKind::All => true,
            };
            if matches {
                count += 1;
            }
        }

        count
    }

    /// Derived display type for stacked sets (e.g. `raid10`), matching
    /// `get_stacked_type()`. Falls back to the set's own type name otherwise.
    pub fn display_type(&self, id: SetId) -> String {
        let set = self.set(id);
        if set.is_group() || set.children.is_empty() {
            return set.ty.display_name().to_string();
        }

        let outer_is_raid0 = set.ty == UnifiedType::Raid0;
        let inner_ty = if outer_is_raid0 {
            set.children
                .first()
                .map(|&c| self.set(c).ty)
                .unwrap_or(set.ty)
        } else {
            set.ty
        };

        let stacked = [
            ["raid10", "raid30", "raid40", "raid50", "raid60"],
            ["raid01", "raid03", "raid04", "raid05", "raid06"],
        ];
        let row = if outer_is_raid0 { 1 } else { 0 };
        let col = match inner_ty {
            UnifiedType::Raid1 => 0,
            UnifiedType::Raid4 => 1,
            t if t.is_raid5() => 2,
            UnifiedType::Raid0 => 3,
            UnifiedType::Raid6 => 4,
            _ => return set.ty.display_name().to_string(),
        };

        stacked[row][col].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    NonSpare,
    Spare,
    All,
}
