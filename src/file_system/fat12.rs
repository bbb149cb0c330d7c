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

    src/file_system/fat12.rs

    The FAT12 file system (including BIOS Parameter Block), for MS-DOS and
    compatible disks, with the reconstruction machinery that rebuilds a BPB
    from a disk whose boot sector is missing or damaged. The Atari ST variant
    differs only in boot-sector verification and the legal filename alphabet.
*/

use crate::disk::Disk;
use crate::file_system::{FileEntry, FileSystem};
use crate::format::{Format, RegularFormat};
use crate::messages::{message, MessageKind};
use crate::sector::Sector;
use crate::track::MergePolicy;
use crate::types::chs::{CylHead, Header};
use crate::types::enums::{DataRate, Encoding};
use crate::DiskError;
use binrw::{binrw, BinRead, BinWrite};
use std::collections::BTreeSet;
use std::io::Cursor;

pub const FILESYSTEM_NAME: &str = "FAT12";
pub const ST_FILESYSTEM_NAME: &str = "STFAT12";

pub const BOOT_SECTOR_CYLHEAD: CylHead = CylHead { cyl: 0, head: 0 };

/// The boot record signature at offset 510.
pub const BOOT_SIGNATURE: u16 = 0xAA55;
/// The Atari ST boot sector is executable when its big-endian word checksum
/// equals this value.
pub const ST_BOOT_CHECKSUM: u16 = 0x1234;

pub const DIR_ENTRY_DELETED_FLAG: u8 = 0xE5;
pub const DIR_ENTRY_ATTR_READ_ONLY: u8 = 0x01;
pub const DIR_ENTRY_ATTR_HIDDEN: u8 = 0x02;
pub const DIR_ENTRY_ATTR_SYSTEM: u8 = 0x04;
pub const DIR_ENTRY_ATTR_VOLUME_ID: u8 = 0x08;
pub const DIR_ENTRY_ATTR_DIRECTORY: u8 = 0x10;
pub const DIR_ENTRY_ATTR_LONG_NAME: u8 = DIR_ENTRY_ATTR_READ_ONLY
    | DIR_ENTRY_ATTR_HIDDEN
    | DIR_ENTRY_ATTR_SYSTEM
    | DIR_ENTRY_ATTR_VOLUME_ID;

const DIR_ENTRY_SIZE: usize = 32;
const DOS_ILLEGAL_NAME_CHARACTERS: &[u8] = br#""*+,./:;<=>?[\]|"#;
const ST_YET_LEGAL_NAME_CHARACTERS: &[u8] = br#""+,;<=>[]|"#;

/// The BIOS Parameter Block, as recorded at offset 0 of the boot sector
/// (jump and OEM name included, BPB proper from offset 0x0B).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[binrw]
#[brw(little)]
pub struct BiosParameterBlock {
    pub jump: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sec: u16,
    pub sec_per_clust: u8,
    pub res_sectors: u16,
    pub fats: u8,
    pub root_dir_ents: u16,
    pub sectors: u16,
    pub media: u8,
    pub fat_secs: u16,
    // Since DOS 3.0:
    pub sec_per_track: u16,
    pub heads: u16,
    pub hidden_secs: u32,
    // Since DOS 3.2:
    pub large_secs: u32,
}

impl BiosParameterBlock {
    pub fn from_sector_data(data: &[u8]) -> Result<Self, DiskError> {
        let mut cursor = Cursor::new(data);
        Ok(BiosParameterBlock::read(&mut cursor)?)
    }

    /// Write the block back over the start of the sector bytes, leaving the
    /// remainder of the boot code alone.
    pub fn store_into_sector_data(&self, data: &mut Vec<u8>) -> Result<(), DiskError> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        let bytes = cursor.into_inner();
        if data.len() < bytes.len() {
            data.resize(bytes.len(), 0);
        }
        data[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
}

/// One 32-byte MS-DOS directory entry.
#[derive(Clone, Debug, Default)]
#[binrw]
#[brw(little)]
pub struct MsdosDirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub lcase: u8,
    pub ctime_cs: u8,
    pub ctime: u16,
    pub cdate: u16,
    pub adate: u16,
    pub starthi: u16,
    pub time: u16,
    pub date: u16,
    pub start: u16,
    pub size: u32,
}

/// Which flavour of FAT12 this is. The ST differs in the boot-sector
/// bootable test and the characters its filenames may carry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Fat12Variant {
    #[default]
    Pc,
    AtariSt,
}

#[derive(Clone, Debug, Default)]
pub struct Fat12FileSystem {
    pub format: Format,
    pub bpb: BiosParameterBlock,
    variant: Fat12Variant,
    fat1: Vec<u8>,
    fat2: Vec<u8>,
    new_fat_sectors: usize,
    new_root_dir_entries: usize,
    sectors_per_cluster_by_root_files: usize,
}

/// Probe constructor for the registry.
pub fn construct_by_approving_disk(disk: &Disk) -> Option<Box<dyn FileSystem>> {
    let mut fs = Fat12FileSystem::new(Fat12Variant::Pc);
    fs.set_format_from_disk(disk).then(|| Box::new(fs) as Box<dyn FileSystem>)
}

pub fn construct_st_by_approving_disk(disk: &Disk) -> Option<Box<dyn FileSystem>> {
    let mut fs = Fat12FileSystem::new(Fat12Variant::AtariSt);
    let boot = fs.boot_sector_data(disk)?;
    if !fs.is_boot_sector_bootable(&boot) {
        return None;
    }
    fs.set_format_from_disk(disk).then(|| Box::new(fs) as Box<dyn FileSystem>)
}

impl Fat12FileSystem {
    pub fn new(variant: Fat12Variant) -> Self {
        Self {
            variant,
            ..Self::default()
        }
    }

    pub fn with_format(variant: Fat12Variant, format: Format) -> Self {
        Self {
            variant,
            format,
            ..Self::default()
        }
    }

    pub fn variant(&self) -> Fat12Variant {
        self.variant
    }

    fn boot_sector_data(&self, disk: &Disk) -> Option<Vec<u8>> {
        let sector = disk
            .find_sector_ignoring_size(&Header::new(0, 0, 1, 2))
            .ok()??;
        if !sector.has_good_normaldata() {
            return None;
        }
        sector.data_best_copy().cloned()
    }

    /// The boot record is only valid with its 0x55AA signature at 510.
    pub fn is_boot_sector_signed(&self, data: &[u8]) -> bool {
        data.len() >= 512 && u16::from_le_bytes([data[510], data[511]]) == BOOT_SIGNATURE
    }

    pub fn is_boot_sector_bootable(&self, data: &[u8]) -> bool {
        match self.variant {
            Fat12Variant::Pc => {
                data.len() >= 3 && ((data[0] == 0xEB && data[2] == 0x90) || data[0] == 0xE9)
            }
            Fat12Variant::AtariSt => {
                // Big-endian word checksum over the first 512 bytes.
                let len = data.len().min(512);
                let sum = data[..len & !1]
                    .chunks_exact(2)
                    .fold(0u16, |acc, w| {
                        acc.wrapping_add(u16::from_be_bytes([w[0], w[1]]))
                    });
                sum == ST_BOOT_CHECKSUM
            }
        }
    }

    /// Adopt the geometry described by the disk's boot sector, if sensible.
    pub fn set_format_from_disk(&mut self, disk: &Disk) -> bool {
        let Some(data) = self.boot_sector_data(disk) else {
            return false;
        };
        let Ok(bpb) = BiosParameterBlock::from_sector_data(&data) else {
            return false;
        };
        self.set_format_by_bpb(&bpb) && bpb.bytes_per_sec as usize == data.len()
    }

    pub fn set_format_by_bpb(&mut self, bpb: &BiosParameterBlock) -> bool {
        self.bpb = bpb.clone();
        if self.format.is_none() {
            self.format = match self.variant {
                Fat12Variant::Pc => Format::from(RegularFormat::Pc720),
                Fat12Variant::AtariSt => Format::from(RegularFormat::AtariSt),
            };
        }

        // Check for a sensible media byte amongst others.
        let entries_per_sector_mask = (bpb.bytes_per_sec as usize / DIR_ENTRY_SIZE).wrapping_sub(1);
        if bpb.sec_per_clust < 1
            || bpb.res_sectors < 1
            || bpb.fats < 1
            || bpb.fats > 2
            || bpb.root_dir_ents == 0
            || (bpb.root_dir_ents as usize & entries_per_sector_mask) != 0
            || (bpb.media != 0xF0 && bpb.media < 0xF8)
            || bpb.fat_secs < 1
        {
            return false;
        }

        self.format.base = 1;
        self.format.sectors = bpb.sec_per_track.min(u8::MAX as u16) as u8;
        self.format.heads = bpb.heads.min(u8::MAX as u16) as u8;
        let total_sectors = bpb.sectors;
        self.format.cyls = if self.format.sectors > 0 && self.format.heads > 0 {
            total_sectors / (self.format.sectors as u16 * self.format.heads as u16)
        }
        else {
            0
        };
        self.format.size = Header::length_to_size_code(bpb.bytes_per_sec as usize);

        if !self.format.try_validate() {
            return false;
        }
        if self.format.total_sectors() != total_sectors as usize {
            message(
                MessageKind::Warning,
                format!(
                    "{} BPB found but total sectors ({}) does not match cyls ({}), heads ({}), sectors ({})",
                    self.name(),
                    total_sectors,
                    self.format.cyls,
                    self.format.heads,
                    self.format.sectors
                ),
            );
        }
        self.format.datarate = if self.format.track_size() < 6000 {
            DataRate::Rate250K
        }
        else if self.format.track_size() < 12_000 {
            DataRate::Rate500K
        }
        else {
            DataRate::Rate1M
        };
        self.format.encoding = Encoding::Mfm;
        self.format.gap3 = 0; // auto, based on sector count
        true
    }

    /// Boot sector is the first logical sector (index 0).
    pub fn get_boot_sector(&self, disk: &Disk) -> Result<Option<Sector>, DiskError> {
        self.get_logical_sector(disk, 0, true)
    }

    /// Translate a logical sector index into its physical address.
    pub fn logical_sector_header(&self, index: usize) -> Header {
        let sectors = self.format.sectors.max(1) as usize;
        let heads = self.format.heads.max(1) as usize;
        let sector_id = (index % sectors) as u8 + self.format.base;
        let track_index = index / sectors;
        Header::new(
            (track_index / heads) as u16,
            (track_index % heads) as u8,
            sector_id,
            self.format.size,
        )
    }

    pub fn get_logical_sector(
        &self,
        disk: &Disk,
        index: usize,
        ignore_size: bool,
    ) -> Result<Option<Sector>, DiskError> {
        if self.format.sectors == 0 || self.format.heads == 0 || self.format.cyls == 0 {
            return Err(DiskError::BadGeometry);
        }
        if index > self.format.disk_size() / self.format.sector_size() {
            return Err(DiskError::BadGeometry);
        }
        let header = self.logical_sector_header(index);
        // Find rather than get, as the sector might be missing.
        if ignore_size {
            disk.find_sector_ignoring_size(&header)
        }
        else {
            disk.find_sector(&header)
        }
    }

    /// The largest FAT size that could fit this disk, assuming worst-case
    /// values for every unknown field.
    pub fn max_fat_sectors_before_analysing(&self) -> usize {
        let res = self.bpb.res_sectors.max(1) as usize;
        let fats = self.bpb.fats.max(1) as usize;
        let max_file_data_sectors = self
            .format
            .total_sectors()
            .saturating_sub(res + fats + 1);
        let max_cluster_index = max_file_data_sectors + 2;
        (max_cluster_index * 3).div_ceil(2 * self.format.sector_size())
    }

    /// Find the FAT size by measuring the cross-similarity of the two FAT
    /// copies at every candidate sector distance.
    pub fn analyse_fat_sectors(&mut self, disk: &Disk) -> Result<usize, DiskError> {
        if self.bpb.fats != 2 {
            return Err(DiskError::UnsuitableTarget);
        }
        let fat1_start = self.bpb.res_sectors as usize;
        let max_fat_sectors = self.max_fat_sectors_before_analysing();
        let sector_size = self.format.sector_size();

        // Cache the logical sectors so the scan is not quadratic in reads.
        // Candidate distances may probe past the end of a small disk.
        let mut logical: Vec<Option<Sector>> = Vec::new();
        for index in fat1_start..fat1_start + max_fat_sectors * 2 {
            if index >= self.format.total_sectors() {
                logical.push(None);
                continue;
            }
            logical.push(self.get_logical_sector(disk, index, false)?);
        }
        let sector_at = |index: usize| -> Option<&Sector> {
            logical
                .get(index - fat1_start)
                .and_then(|s| s.as_ref())
                .filter(|s| s.has_normaldata())
        };

        // Collect similarity per candidate distance.
        let mut match_score = vec![0.0f64; max_fat_sectors + 1];
        let mut participants = vec![0u32; max_fat_sectors + 1];
        for dist in 1..=max_fat_sectors {
            for index in fat1_start..fat1_start + dist {
                let (Some(fat1_sector), Some(fat2_sector)) =
                    (sector_at(index), sector_at(index + dist))
                else {
                    continue;
                };
                let fat1_data = fat1_sector.data_best_copy().expect("normal data");
                let fat2_data = fat2_sector.data_best_copy().expect("normal data");
                let common = fat1_data.len().min(fat2_data.len()).min(sector_size);

                let mut sum = 0i64;
                let mut equal = 0i64;
                let mut difference = 0i64;
                for i in 0..common {
                    let byte = fat1_data[i] as i64;
                    if fat1_data[i] == fat2_data[i] {
                        equal += 1;
                    }
                    sum += byte;
                    // Distance from the running average spots non-FAT filler.
                    let avg = (sum as f64 / (i + 1) as f64).round() as i64;
                    difference += (byte - avg).abs();
                }
                // equal/common is in [0,1]; difference/common is in [0,128).
                match_score[dist] +=
                    equal as f64 * difference as f64 / 128.0 / common as f64 / common as f64;
                participants[dist] += 1;
            }
        }

        // The best distance wins, weighted towards matches of more sectors.
        let mut best_dist = 0usize;
        let mut best_percent = 0.0f64;
        for dist in 1..=max_fat_sectors {
            if participants[dist] == 0 {
                continue;
            }
            let percent =
                100.0 * match_score[dist] / participants[dist] as f64 * (dist as f64).sqrt();
            if percent > best_percent {
                best_dist = dist;
                best_percent = percent;
            }
        }
        if best_dist != 3 && best_dist != 5 {
            message(
                MessageKind::Warning,
                format!("found not normal {} sectors per FAT value", best_dist),
            );
        }

        // Store the FAT copies contiguously for 3-byte FAT12 processing.
        let fat_len = best_dist * sector_size;
        self.fat1 = vec![0; fat_len];
        self.fat2 = vec![0; fat_len];
        for index in fat1_start..fat1_start + best_dist {
            let offset = (index - fat1_start) * sector_size;
            if let Some(sector) = sector_at(index) {
                let data = sector.data_best_copy().expect("normal data");
                let common = data.len().min(sector_size);
                self.fat1[offset..offset + common].copy_from_slice(&data[..common]);
            }
            if let Some(sector) = sector_at(index + best_dist) {
                let data = sector.data_best_copy().expect("normal data");
                let common = data.len().min(sector_size);
                self.fat2[offset..offset + common].copy_from_slice(&data[..common]);
            }
        }
        self.new_fat_sectors = best_dist;
        Ok(best_dist)
    }

    pub fn is_eof_fat_index(&self, index: usize) -> bool {
        (0xFF8..=0xFFF).contains(&index)
    }

    pub fn is_next_fat_index(&self, index: usize) -> bool {
        (2..=0xFEF).contains(&index)
    }

    pub fn is_used_fat_index(&self, index: usize) -> bool {
        self.is_eof_fat_index(index) || self.is_next_fat_index(index)
    }

    fn fat_entry(data: &[u8], cluster: usize) -> usize {
        let byte_index = (cluster & !1) * 3 / 2;
        if byte_index + 2 >= data.len() {
            return 0;
        }
        if cluster & 1 == 0 {
            ((data[byte_index + 1] as usize & 0x0F) << 8) + data[byte_index] as usize
        }
        else {
            ((data[byte_index + 1] as usize & 0xF0) >> 4) + ((data[byte_index + 2] as usize) << 4)
        }
    }

    /// Walk the cluster chain from `start_cluster`, preferring FAT1 but
    /// falling back to FAT2 whenever FAT1 yields an invalid link.
    pub fn get_file_cluster_amount(&self, start_cluster: usize) -> usize {
        let fat_byte_len = self.new_fat_sectors * self.format.sector_size();
        let cluster_sup = fat_byte_len * 2 / 3;
        let mut amount = 0usize;
        let mut cluster = start_cluster;
        loop {
            if cluster >= cluster_sup {
                message(
                    MessageKind::Warning,
                    format!(
                        "found out of range FAT cluster index {}, it must be < {}",
                        cluster, cluster_sup
                    ),
                );
                break;
            }
            let next1 = Self::fat_entry(&self.fat1, cluster);
            let next2 = Self::fat_entry(&self.fat2, cluster);

            // Prefer the first FAT, but a NEXT link even more.
            let mut next = next1;
            if !self.is_next_fat_index(next1) && self.is_next_fat_index(next2) {
                next = next2;
            }
            if !self.is_used_fat_index(next1) && self.is_used_fat_index(next2) {
                next = next2;
            }
            if !self.is_used_fat_index(next) {
                break;
            }
            amount += 1;
            // A looping chain is corrupt; don't follow it forever.
            if amount > cluster_sup {
                message(
                    MessageKind::Warning,
                    format!("cluster chain from {} never terminates", start_cluster),
                );
                break;
            }
            if self.is_eof_fat_index(next) {
                break;
            }
            cluster = next;
        }
        amount
    }

    pub fn is_short_name_char_valid(&self, character: u8, pos: usize) -> bool {
        let base_valid = {
            if pos == 0 && character == b' ' {
                false
            }
            else if character < b' ' {
                false
            }
            else if character.is_ascii_lowercase() {
                false
            }
            else if DOS_ILLEGAL_NAME_CHARACTERS.contains(&character) {
                false
            }
            else {
                character != 127 && character != DIR_ENTRY_DELETED_FLAG
            }
        };
        match self.variant {
            Fat12Variant::Pc => base_valid,
            // The ST additionally tolerates several DOS-illegal characters.
            Fat12Variant::AtariSt => {
                base_valid || ST_YET_LEGAL_NAME_CHARACTERS.contains(&character)
            }
        }
    }

    pub fn is_valid_short_name(&self, name: &[u8]) -> bool {
        name.iter()
            .enumerate()
            .all(|(pos, &ch)| self.is_short_name_char_valid(ch, pos))
    }

    /// Decode "NAME    EXT" into "NAME.EXT", flagging invalid names.
    pub fn name_with_ext3(&self, entry: &MsdosDirEntry, accept_deleted: bool) -> (String, bool) {
        let mut raw = entry.name;
        let deleted = accept_deleted && raw[0] == DIR_ENTRY_DELETED_FLAG;
        let valid = self.is_valid_short_name(if deleted { &raw[1..] } else { &raw });
        if deleted {
            raw[0] = b'?';
        }
        let name = String::from_utf8_lossy(&raw[..8]).trim_end().to_string();
        let ext = String::from_utf8_lossy(&raw[8..]).trim_end().to_string();
        let full = if ext.is_empty() {
            name
        }
        else {
            format!("{name}.{ext}")
        };
        (full, valid)
    }

    /// Walk the root directory to observe the sectors-per-cluster hinted by
    /// each file's size and chain length, and measure the directory size.
    /// Returns the root directory entry count, clamped to a normal value
    /// when plausible.
    pub fn analyse_dir_entries(&mut self, disk: &Disk) -> Result<usize, DiskError> {
        let fat1_start = self.bpb.res_sectors as usize;
        let fat_sectors = self.bpb.fat_secs as usize;
        let dir_start = fat1_start + self.bpb.fats as usize * fat_sectors;
        let sector_size = self.format.sector_size();

        let normal_dir_entries_1 = 0x70usize;
        let normal_dir_entries_2 = 0xE0usize;
        let normal_dir_sectors_1 = normal_dir_entries_1 * DIR_ENTRY_SIZE / sector_size;
        let normal_dir_sectors_2 = normal_dir_entries_2 * DIR_ENTRY_SIZE / sector_size;
        let normal_dir_entries = if self.format.sectors <= 11 {
            normal_dir_entries_1
        }
        else {
            normal_dir_entries_2
        };
        let max_dir_entries = 0x200usize;
        let max_dir_sectors = max_dir_entries * DIR_ENTRY_SIZE / sector_size;

        let mut sum_sectors_per_cluster = 0usize;
        let mut participants = 0usize;
        let mut looking_for_0 = true;
        let mut found_not_0_after_0 = false;
        let mut first_0_dir_sector = 0usize;
        let mut dir_sector_i = dir_start;
        while dir_sector_i < dir_start + max_dir_sectors {
            if let Some(sector) = self.get_logical_sector(disk, dir_sector_i, false)? {
                if sector.has_normaldata() {
                    let data = sector.data_best_copy().expect("normal data").clone();
                    let scan_len = data.len().min(sector_size);
                    for i in (0..scan_len).step_by(DIR_ENTRY_SIZE) {
                        let entry =
                            MsdosDirEntry::read(&mut Cursor::new(&data[i..i + DIR_ENTRY_SIZE]))?;
                        if looking_for_0 {
                            if entry.name[0] == 0 {
                                looking_for_0 = false;
                                first_0_dir_sector = dir_sector_i + usize::from(i > 0);
                            }
                            // The entry must be a plain file: not deleted,
                            // not a label, not a directory, not a long-name
                            // fragment. Directories cannot be read yet, as
                            // the cluster size is still unknown.
                            else if entry.name[0] != DIR_ENTRY_DELETED_FLAG
                                && (entry.attr & 0x18) == 0
                                && entry.name[0] >= 33
                            {
                                let cluster_amount =
                                    self.get_file_cluster_amount(entry.start as usize);
                                if cluster_amount > 1 {
                                    let per_cluster = (entry.size as f64
                                        / sector_size as f64
                                        / cluster_amount as f64)
                                        .ceil() as usize;
                                    sum_sectors_per_cluster += per_cluster;
                                    participants += 1;
                                }
                            }
                        }
                        else if entry.name[0] != 0 {
                            found_not_0_after_0 = true;
                            break;
                        }
                    }
                    if found_not_0_after_0 {
                        break;
                    }
                }
            }
            dir_sector_i += 1;
        }

        if participants > 0 {
            self.sectors_per_cluster_by_root_files =
                (sum_sectors_per_cluster as f64 / participants as f64).round() as usize;
        }

        let max_found_dir_sectors = (dir_sector_i - dir_start).max(1);
        let min_found_dir_sectors = first_0_dir_sector.saturating_sub(dir_start).max(1);
        // If a normal directory size is within [min, max], prefer it.
        let found_dir_sectors = if (min_found_dir_sectors..=max_found_dir_sectors)
            .contains(&normal_dir_sectors_1)
        {
            normal_dir_sectors_1
        }
        else if (min_found_dir_sectors..=max_found_dir_sectors).contains(&normal_dir_sectors_2) {
            normal_dir_sectors_2
        }
        else {
            max_found_dir_sectors
        };

        let found_dir_entries = found_dir_sectors * sector_size / DIR_ENTRY_SIZE;
        if found_dir_entries != normal_dir_entries_1 && found_dir_entries != normal_dir_entries_2 {
            message(
                MessageKind::Warning,
                format!(
                    "found not normal {} directory entries value, it should be {} normally",
                    found_dir_entries, normal_dir_entries
                ),
            );
        }
        self.new_root_dir_entries = found_dir_entries;
        Ok(found_dir_entries)
    }

    /// The smallest power of two satisfying both the FAT capacity constraint
    /// and the directory-walk observation.
    pub fn determine_sectors_per_cluster(&self) -> usize {
        let res = self.bpb.res_sectors as usize;
        let fat_sectors = self.bpb.fat_secs as usize;
        // Start with the worst case of the unknown root directory size.
        let max_file_data_sectors = self
            .format
            .total_sectors()
            .saturating_sub(res + self.bpb.fats as usize * fat_sectors + 1);
        let max_cluster_index_by_fat = fat_sectors * self.format.sector_size() / 3 * 2;
        let min_spc = max_file_data_sectors
            .div_ceil(max_cluster_index_by_fat.saturating_sub(2).max(1));
        let spc = min_spc.max(self.sectors_per_cluster_by_root_files).max(1);
        let spc_power2 = spc.next_power_of_two();
        if spc_power2 != 1 && spc_power2 != 2 {
            message(
                MessageKind::Warning,
                format!("found not normal {} sectors per cluster value", spc_power2),
            );
        }
        spc_power2
    }

    /// Rebuild the BPB from the disk's geometry and surviving structures.
    /// Returns true iff any field changed.
    pub fn reconstruct_bpb(&mut self, disk: &Disk) -> Result<bool, DiskError> {
        let bpb_previous = self.bpb.clone();

        self.bpb.sectors = self.format.total_sectors() as u16;
        self.bpb.sec_per_track = self.format.sectors as u16;
        self.bpb.heads = self.format.heads as u16;
        self.bpb.bytes_per_sec = self.format.sector_size() as u16; // 512 by standard
        self.bpb.res_sectors = 1; // the boot sector itself
        self.bpb.fats = 2; // 2 by standard
        // On the Atari ST disks had 2 heads, at least 9 sectors and at least
        // 80 tracks, so the media byte is usually 0xF9.
        self.bpb.media = 0xF8
            | if self.format.cyls <= 42 { 0x4 } else { 0 }
            | if self.format.sectors <= 8 { 0x2 } else { 0 }
            | if self.format.heads == 2 { 0x1 } else { 0 };

        let stored_fat_secs = bpb_previous.fat_secs as usize;
        let stored_spc = bpb_previous.sec_per_clust as usize;
        if (1..=self.max_fat_sectors_before_analysing()).contains(&stored_fat_secs)
            && (1..=4).contains(&stored_spc)
        {
            message(
                MessageKind::Info,
                "the sectors per FAT and sectors per cluster values seem to be valid",
            );
        }

        // Varies a lot, depending mainly on disk size and cluster count.
        self.new_fat_sectors = self.analyse_fat_sectors(disk)?;
        self.bpb.fat_secs = self.new_fat_sectors as u16;
        self.new_root_dir_entries = self.analyse_dir_entries(disk)?;
        self.bpb.root_dir_ents = self.new_root_dir_entries as u16; // 0x70 or 0xE0 normally
        // Usually 2, sometimes 1 when less loss per cluster is wanted at the
        // cost of a bigger FAT.
        self.bpb.sec_per_clust = self.determine_sectors_per_cluster() as u8;

        Ok(self.bpb != bpb_previous)
    }

    /// Make sure a boot sector exists so a reconstructed BPB has somewhere
    /// to live. A manufactured sector is flagged bad so future repairs can
    /// still improve it.
    pub fn ensure_boot_sector(&mut self, disk: &mut Disk) -> Result<bool, DiskError> {
        if self.format.base != 1 {
            return Err(DiskError::UnsuitableTarget);
        }
        if let Some(boot) = self.get_boot_sector(disk)? {
            if boot.has_data() {
                return Ok(false);
            }
        }

        let header = Header::with_cylhead(BOOT_SECTOR_CYLHEAD, 1, self.format.size);
        let mut track = disk.read_track(BOOT_SECTOR_CYLHEAD)?;
        if track.find_ignoring_size(&header).is_none() {
            if self.format.datarate == DataRate::Unknown
                || self.format.encoding == Encoding::Unknown
            {
                return Err(DiskError::BadGeometry);
            }
            let sector = Sector::new(self.format.datarate, self.format.encoding, header);
            track.insert(0, sector)?;
        }

        let index = track
            .sectors()
            .iter()
            .position(|s| s.header.sector == 1 && s.header.cyl == 0 && s.header.head == 0)
            .expect("boot sector just ensured");
        if !track.sector(index).has_data() {
            let mut data = vec![self.format.fill; self.format.sector_size()];
            let sign = crate::image::MISSING_SECTOR_SIGN;
            data[..sign.len()].copy_from_slice(sign);
            track.sector_mut(index).replace_data(data, true);
        }
        disk.write_track(BOOT_SECTOR_CYLHEAD, track);
        Ok(true)
    }

    pub fn read_bpb_from_disk(&mut self, disk: &Disk) -> Result<(), DiskError> {
        let boot = self
            .get_boot_sector(disk)?
            .filter(|s| s.has_data())
            .ok_or(DiskError::MissingBootSector)?;
        let data = boot.data_best_copy().expect("has data");
        self.bpb = BiosParameterBlock::from_sector_data(data)?;
        Ok(())
    }

    /// Copy the BPB bytes into the boot sector. The bytes are copied out,
    /// mutated and written back rather than aliased in place.
    pub fn write_bpb_to_disk(&self, disk: &mut Disk) -> Result<(), DiskError> {
        let boot = self
            .get_boot_sector(disk)?
            .filter(|s| s.has_data())
            .ok_or(DiskError::MissingBootSector)?;
        let _ = boot;

        let mut track = disk.read_track(BOOT_SECTOR_CYLHEAD)?;
        let header = Header::with_cylhead(BOOT_SECTOR_CYLHEAD, 1, self.format.size);
        let Some(index) = track
            .sectors()
            .iter()
            .position(|s| s.header.sector == header.sector && s.header.cyl == header.cyl)
        else {
            return Err(DiskError::MissingBootSector);
        };
        let sector = track.sector_mut(index);
        let bad = sector.has_baddatacrc();
        let mut data = sector
            .data_best_copy()
            .cloned()
            .ok_or(DiskError::MissingBootSector)?;
        self.bpb.store_into_sector_data(&mut data)?;
        sector.replace_data(data, bad);
        disk.write_track(BOOT_SECTOR_CYLHEAD, track);
        Ok(())
    }

    /// The tracks holding any file-system structure or allocated cluster,
    /// for minimal-mode transfers.
    pub fn used_tracks(&self) -> BTreeSet<CylHead> {
        let mut used = BTreeSet::new();
        let mut mark = |logical: usize| {
            let header = self.logical_sector_header(logical);
            used.insert(header.cylhead());
        };

        let res = self.bpb.res_sectors.max(1) as usize;
        let fat_secs = self.bpb.fat_secs as usize;
        let dir_sectors =
            self.bpb.root_dir_ents as usize * DIR_ENTRY_SIZE / self.format.sector_size();
        let system_sectors = res + self.bpb.fats as usize * fat_secs + dir_sectors;
        for logical in 0..system_sectors {
            mark(logical);
        }

        // Allocated clusters, from whichever FAT copy looks used.
        let cluster_sup = self.fat1.len() * 2 / 3;
        let spc = self.bpb.sec_per_clust.max(1) as usize;
        for cluster in 2..cluster_sup {
            let used_link = self.is_used_fat_index(Self::fat_entry(&self.fat1, cluster))
                || self.is_used_fat_index(Self::fat_entry(&self.fat2, cluster));
            if used_link {
                let logical = system_sectors + (cluster - 2) * spc;
                for s in 0..spc {
                    mark(logical + s);
                }
            }
        }
        used
    }
}

impl FileSystem for Fat12FileSystem {
    fn name(&self) -> String {
        match self.variant {
            Fat12Variant::Pc => FILESYSTEM_NAME.to_string(),
            Fat12Variant::AtariSt => ST_FILESYSTEM_NAME.to_string(),
        }
    }

    fn format(&self) -> &Format {
        &self.format
    }

    fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    fn dir(&self, disk: &Disk) -> Result<Vec<FileEntry>, DiskError> {
        let fat1_start = self.bpb.res_sectors as usize;
        let dir_start = fat1_start + self.bpb.fats as usize * self.bpb.fat_secs as usize;
        let sector_size = self.format.sector_size();
        let dir_sectors = self.bpb.root_dir_ents as usize * DIR_ENTRY_SIZE / sector_size;

        let mut entries = Vec::new();
        'sectors: for dir_sector_i in dir_start..dir_start + dir_sectors {
            let Some(sector) = self.get_logical_sector(disk, dir_sector_i, false)? else {
                message(
                    MessageKind::Warning,
                    format!("logical sector {} is missing", dir_sector_i),
                );
                continue;
            };
            if !sector.has_normaldata() {
                message(
                    MessageKind::Warning,
                    format!(
                        "logical sector {} exists but its size is not normal",
                        dir_sector_i
                    ),
                );
                continue;
            }
            let data = sector.data_best_copy().expect("normal data");
            for i in (0..data.len().min(sector_size)).step_by(DIR_ENTRY_SIZE) {
                let entry = MsdosDirEntry::read(&mut Cursor::new(&data[i..i + DIR_ENTRY_SIZE]))?;
                if entry.name[0] == 0 {
                    break 'sectors;
                }
                if entry.attr == DIR_ENTRY_ATTR_LONG_NAME || entry.name[0] < 33 {
                    continue;
                }
                let deleted = entry.name[0] == DIR_ENTRY_DELETED_FLAG;
                let (name, _valid) = self.name_with_ext3(&entry, true);
                entries.push(FileEntry {
                    name,
                    size: entry.size,
                    start_cluster: entry.start,
                    attributes: entry.attr,
                    deleted,
                    is_directory: entry.attr & DIR_ENTRY_ATTR_DIRECTORY != 0,
                    is_volume_label: entry.attr & DIR_ENTRY_ATTR_VOLUME_ID != 0,
                    date: entry.date,
                    time: entry.time,
                });
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::enums::DAM_NORMAL;

    /// Build a 720K disk image in memory: boot sector, two FAT copies, a
    /// root directory with `files`, and their cluster chains.
    pub fn build_720k_disk(zero_boot_sector: bool, files: &[(usize, u32)]) -> Disk {
        let fmt = Format::from(RegularFormat::Pc720);
        let sector_size = fmt.sector_size();
        let fat_secs = 3usize;
        let spc = 2usize;
        let mut image = vec![0u8; fmt.disk_size()];

        if !zero_boot_sector {
            let bpb = BiosParameterBlock {
                jump: [0xEB, 0x3C, 0x90],
                oem_name: *b"FLUXMEND",
                bytes_per_sec: 512,
                sec_per_clust: spc as u8,
                res_sectors: 1,
                fats: 2,
                root_dir_ents: 0x70,
                sectors: 1440,
                media: 0xF9,
                fat_secs: fat_secs as u16,
                sec_per_track: 9,
                heads: 2,
                hidden_secs: 0,
                large_secs: 0,
            };
            let mut cursor = Cursor::new(Vec::new());
            bpb.write(&mut cursor).unwrap();
            let bytes = cursor.into_inner();
            image[..bytes.len()].copy_from_slice(&bytes);
            image[510] = 0x55;
            image[511] = 0xAA;
        }

        // Two identical FAT copies with the chains of every file.
        let mut fat = vec![0u8; fat_secs * sector_size];
        let set_entry = |fat: &mut [u8], cluster: usize, value: usize| {
            let byte_index = (cluster & !1) * 3 / 2;
            if cluster & 1 == 0 {
                fat[byte_index] = (value & 0xFF) as u8;
                fat[byte_index + 1] =
                    (fat[byte_index + 1] & 0xF0) | ((value >> 8) & 0x0F) as u8;
            }
            else {
                fat[byte_index + 1] =
                    (fat[byte_index + 1] & 0x0F) | (((value & 0x0F) << 4) as u8);
                fat[byte_index + 2] = ((value >> 4) & 0xFF) as u8;
            }
        };
        set_entry(&mut fat, 0, 0xFF9);
        set_entry(&mut fat, 1, 0xFFF);
        let mut next_cluster = 2usize;
        let mut dir = Vec::new();
        for (n, &(clusters, size)) in files.iter().enumerate() {
            for i in 0..clusters {
                let link = if i + 1 == clusters {
                    0xFFF
                }
                else {
                    next_cluster + i + 1
                };
                set_entry(&mut fat, next_cluster + i, link);
            }
            let mut entry = MsdosDirEntry {
                name: *b"FILE       ",
                attr: 0x20,
                start: next_cluster as u16,
                size,
                ..MsdosDirEntry::default()
            };
            entry.name[4] = b'0' + n as u8;
            let mut cursor = Cursor::new(Vec::new());
            entry.write(&mut cursor).unwrap();
            dir.extend(cursor.into_inner());
            next_cluster += clusters;
        }

        let fat1_offset = sector_size;
        let fat2_offset = sector_size * (1 + fat_secs);
        image[fat1_offset..fat1_offset + fat.len()].copy_from_slice(&fat);
        image[fat2_offset..fat2_offset + fat.len()].copy_from_slice(&fat);

        let dir_offset = sector_size * (1 + 2 * fat_secs);
        image[dir_offset..dir_offset + dir.len()].copy_from_slice(&dir);

        // Distinguishable cluster payloads so chains read back sensibly.
        let data_offset = dir_offset + 0x70 * DIR_ENTRY_SIZE;
        for (i, byte) in image[data_offset..].iter_mut().enumerate() {
            *byte = (i / (sector_size * spc)) as u8;
        }

        let mut disk = Disk::new();
        disk.format_disk(&fmt, &image).unwrap();
        disk
    }

    /// Enough files to populate all three FAT sectors, so the distance
    /// analysis has real content to correlate.
    fn heavy_files() -> Vec<(usize, u32)> {
        (0..20).map(|_| (35usize, 35 * 1024u32)).collect()
    }

    #[test]
    fn boot_sector_approval() {
        let disk = build_720k_disk(false, &[(3, 2500), (5, 4700)]);
        let fs = construct_by_approving_disk(&disk).expect("FAT12 should approve");
        assert_eq!(fs.name(), FILESYSTEM_NAME);
        let fmt = fs.format();
        assert_eq!((fmt.cyls, fmt.heads, fmt.sectors), (80, 2, 9));
    }

    #[test]
    fn zeroed_boot_sector_is_rejected() {
        let disk = build_720k_disk(true, &[(3, 2500)]);
        assert!(construct_by_approving_disk(&disk).is_none());
    }

    #[test]
    fn fat_sector_analysis_finds_distance() {
        let disk = build_720k_disk(true, &heavy_files());
        let mut fs = Fat12FileSystem::with_format(
            Fat12Variant::Pc,
            Format::from(RegularFormat::Pc720),
        );
        fs.bpb.res_sectors = 1;
        fs.bpb.fats = 2;
        assert_eq!(fs.analyse_fat_sectors(&disk).unwrap(), 3);
    }

    #[test]
    fn cluster_chains_are_walked_with_fat2_fallback() {
        let disk = build_720k_disk(true, &[(4, 3600)]);
        let mut fs = Fat12FileSystem::with_format(
            Fat12Variant::Pc,
            Format::from(RegularFormat::Pc720),
        );
        fs.bpb.res_sectors = 1;
        fs.bpb.fats = 2;
        fs.analyse_fat_sectors(&disk).unwrap();
        assert_eq!(fs.get_file_cluster_amount(2), 4);

        // Corrupt the first FAT's link; the second copy still resolves it.
        fs.fat1[3] = 0xFF;
        fs.fat1[4] = 0xFF;
        assert_eq!(fs.get_file_cluster_amount(2), 4);
    }

    #[test]
    fn reconstructs_bpb_of_damaged_boot_sector() {
        crate::messages::drain();
        let disk = build_720k_disk(true, &heavy_files());
        let mut fs = Fat12FileSystem::with_format(
            Fat12Variant::Pc,
            Format::from(RegularFormat::Pc720),
        );
        let changed = fs.reconstruct_bpb(&disk).unwrap();
        assert!(changed);
        assert_eq!(fs.bpb.fat_secs, 3);
        assert_eq!(fs.bpb.res_sectors, 1);
        assert_eq!(fs.bpb.fats, 2);
        assert_eq!(fs.bpb.media, 0xF9);
        assert_eq!(fs.bpb.sec_per_clust, 2);
        assert_eq!(fs.bpb.root_dir_ents, 0x70);
        assert_eq!(fs.bpb.sectors, 1440);
    }

    #[test]
    fn directory_listing_reads_entries() {
        let disk = build_720k_disk(false, &[(3, 2500), (5, 4700)]);
        let fs = construct_by_approving_disk(&disk).unwrap();
        let entries = fs.dir(&disk).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "FILE0");
        assert_eq!(entries[1].size, 4700);
    }

    #[test]
    fn st_boot_checksum_is_required() {
        let fs = Fat12FileSystem::new(Fat12Variant::AtariSt);
        let mut data = vec![0u8; 512];
        assert!(!fs.is_boot_sector_bootable(&data));
        // Adjust one word so the big-endian sum equals 0x1234.
        data[0] = 0x12;
        data[1] = 0x34;
        assert!(fs.is_boot_sector_bootable(&data));
    }

    #[test]
    fn st_accepts_wider_name_alphabet() {
        let pc = Fat12FileSystem::new(Fat12Variant::Pc);
        let st = Fat12FileSystem::new(Fat12Variant::AtariSt);
        assert!(!pc.is_short_name_char_valid(b'+', 1));
        assert!(st.is_short_name_char_valid(b'+', 1));
        assert!(!st.is_short_name_char_valid(b'*', 1));
    }
}
