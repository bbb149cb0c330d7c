/*
    FluxMend
    https://github.com/dbalsom/fluxmend

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/file_system/mod.rs

    The file-system plug-in interface and its process-wide registry.
*/

pub mod fat12;

use crate::disk::Disk;
use crate::format::Format;
use crate::DiskError;
use dyn_clone::DynClone;
use std::fmt::Debug;

/// One root-directory entry, decoded for listings.
#[derive(Clone, Debug, Default)]
pub struct FileEntry {
    pub name: String,
    pub size: u32,
    pub start_cluster: u16,
    pub attributes: u8,
    pub deleted: bool,
    pub is_directory: bool,
    pub is_volume_label: bool,
    /// Raw FAT-encoded date and time fields.
    pub date: u16,
    pub time: u16,
}

/// A detected file system living on a disk. Implementations are cloneable so
/// the owning disk stays cloneable.
pub trait FileSystem: DynClone + Debug + Send + Sync {
    fn name(&self) -> String;

    fn format(&self) -> &Format;

    fn set_format(&mut self, format: Format);

    fn is_same_named(&self, other: &dyn FileSystem) -> bool {
        self.name() == other.name()
    }

    fn is_same_named_with_same_cyl_head_sectors_size(&self, other: &dyn FileSystem) -> bool {
        let a = self.format();
        let b = other.format();
        self.is_same_named(other)
            && a.cyls == b.cyls
            && a.heads == b.heads
            && a.sectors == b.sectors
            && a.size == b.size
    }

    /// List the root directory.
    fn dir(&self, disk: &Disk) -> Result<Vec<FileEntry>, DiskError>;
}

dyn_clone::clone_trait_object!(FileSystem);

type Constructor = fn(&Disk) -> Option<Box<dyn FileSystem>>;

/// The ordered list of file systems probed when a disk is opened. More
/// specific systems come first.
const REGISTRY: &[(&str, Constructor)] = &[
    (fat12::ST_FILESYSTEM_NAME, fat12::construct_st_by_approving_disk),
    (fat12::FILESYSTEM_NAME, fat12::construct_by_approving_disk),
];

/// Probe a disk against every registered file system, in order.
pub fn detect_file_system(disk: &Disk) -> Option<Box<dyn FileSystem>> {
    REGISTRY.iter().find_map(|(_, construct)| construct(disk))
}

/// The registered file system names, in probe order.
pub fn file_system_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}
