mod common;

use common::*;
use binrw::BinWrite;
use fluxmend::file_system::fat12::{
    construct_by_approving_disk, BiosParameterBlock, Fat12FileSystem, Fat12Variant, MsdosDirEntry,
};
use fluxmend::image::raw::read_raw;
use fluxmend::{CoreOptions, Disk, Format};
use std::io::Cursor;

const SECTOR_SIZE: usize = 512;
const FAT_SECS: usize = 3;
const SPC: usize = 2;

/// Build the raw bytes of a 720K FAT12 disk: boot sector (optionally
/// zero-filled), two FAT copies, a root directory, and cluster chains.
fn build_720k_image(zero_boot_sector: bool, files: &[(usize, u32)]) -> Vec<u8> {
    let mut image = vec![0u8; 737_280];

    if !zero_boot_sector {
        let bpb = BiosParameterBlock {
            jump: [0xEB, 0x3C, 0x90],
            oem_name: *b"FLUXMEND",
            bytes_per_sec: 512,
            sec_per_clust: SPC as u8,
            res_sectors: 1,
            fats: 2,
            root_dir_ents: 0x70,
            sectors: 1440,
            media: 0xF9,
            fat_secs: FAT_SECS as u16,
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

    let mut fat = vec![0u8; FAT_SECS * SECTOR_SIZE];
    let set_entry = |fat: &mut [u8], cluster: usize, value: usize| {
        let b = (cluster & !1) * 3 / 2;
        if cluster & 1 == 0 {
            fat[b] = (value & 0xFF) as u8;
            fat[b + 1] = (fat[b + 1] & 0xF0) | ((value >> 8) & 0x0F) as u8;
        }
        else {
            fat[b + 1] = (fat[b + 1] & 0x0F) | (((value & 0x0F) << 4) as u8);
            fat[b + 2] = ((value >> 4) & 0xFF) as u8;
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
        entry.name[4] = b'0' + (n % 10) as u8;
        let mut cursor = Cursor::new(Vec::new());
        entry.write(&mut cursor).unwrap();
        dir.extend(cursor.into_inner());
        next_cluster += clusters;
    }

    let fat1_offset = SECTOR_SIZE;
    let fat2_offset = SECTOR_SIZE * (1 + FAT_SECS);
    image[fat1_offset..fat1_offset + fat.len()].copy_from_slice(&fat);
    image[fat2_offset..fat2_offset + fat.len()].copy_from_slice(&fat);

    let dir_offset = SECTOR_SIZE * (1 + 2 * FAT_SECS);
    image[dir_offset..dir_offset + dir.len()].copy_from_slice(&dir);

    let data_offset = dir_offset + 0x70 * 32;
    for (i, byte) in image[data_offset..].iter_mut().enumerate() {
        *byte = (i / (SECTOR_SIZE * SPC)).wrapping_add(1) as u8;
    }

    image
}

fn heavy_files() -> Vec<(usize, u32)> {
    (0..20).map(|_| (35usize, 35 * 1024u32)).collect()
}

fn load_disk(image: &[u8]) -> Disk {
    read_raw(image, &CoreOptions::default()).unwrap()
}

/// A disk whose boot sector is intact is approved directly; the BPB decides
/// the geometry.
#[test]
fn intact_boot_sector_is_approved() {
    init();
    let disk = load_disk(&build_720k_image(false, &[(3, 2500), (5, 4700)]));
    let fs = construct_by_approving_disk(&disk).expect("FAT12 approval");
    let fmt = fs.format();
    assert_eq!((fmt.cyls, fmt.heads, fmt.sectors), (80, 2, 9));

    let entries = fs.dir(&disk).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "FILE0");
    assert_eq!(entries[0].start_cluster, 2);
    assert_eq!(entries[1].size, 4700);
}

/// The §8 scenario: logical sector 0 zero-filled, FATs intact at logical
/// sectors 1 and 4. The analysis recovers every BPB field.
#[test]
fn reconstruct_bpb_with_missing_boot_sector() {
    init();
    let disk = load_disk(&build_720k_image(true, &heavy_files()));
    assert!(construct_by_approving_disk(&disk).is_none());

    let format = Format::from_size(737_280).unwrap();
    let mut fs = Fat12FileSystem::with_format(Fat12Variant::Pc, format);
    let changed = fs.reconstruct_bpb(&disk).unwrap();
    assert!(changed);

    assert_eq!(fs.bpb.fat_secs, 3);
    assert_eq!(fs.bpb.res_sectors, 1);
    assert_eq!(fs.bpb.fats, 2);
    assert_eq!(fs.bpb.media, 0xF9);
    assert_eq!(fs.bpb.sec_per_clust, 2);
    assert_eq!(fs.bpb.root_dir_ents, 0x70);
    assert_eq!(fs.bpb.sectors, 1440);
    assert_eq!(fs.bpb.bytes_per_sec, 512);
}

/// After reconstruction the BPB is written back through the sector bytes,
/// and reads back identically.
#[test]
fn reconstructed_bpb_round_trips_through_the_boot_sector() {
    init();
    let mut disk = load_disk(&build_720k_image(true, &heavy_files()));
    let format = Format::from_size(737_280).unwrap();
    let mut fs = Fat12FileSystem::with_format(Fat12Variant::Pc, format);
    fs.reconstruct_bpb(&disk).unwrap();

    fs.write_bpb_to_disk(&mut disk).unwrap();
    let written = fs.bpb.clone();

    let mut reread = Fat12FileSystem::with_format(
        Fat12Variant::Pc,
        Format::from_size(737_280).unwrap(),
    );
    reread.read_bpb_from_disk(&disk).unwrap();
    assert_eq!(reread.bpb, written);
}

/// A manufactured boot sector is flagged bad so later repairs can improve it.
#[test]
fn ensure_boot_sector_creates_a_repairable_sector() {
    init();
    let mut disk = Disk::new();
    let ch = fluxmend::CylHead::new(0, 0);
    let mut track = sequential_track(ch, 9);
    // Remove the boot sector entirely.
    let index = track
        .sectors()
        .iter()
        .position(|s| s.header.sector == 1)
        .unwrap();
    track.remove(index);
    disk.write_track(ch, track);

    let mut fs = Fat12FileSystem::with_format(
        Fat12Variant::Pc,
        Format::from_size(737_280).unwrap(),
    );
    let created = fs.ensure_boot_sector(&mut disk).unwrap();
    assert!(created);

    let boot = fs.get_boot_sector(&disk).unwrap().expect("boot exists now");
    assert!(boot.has_data());
    assert!(boot.has_baddatacrc());
    assert!(!fs.ensure_boot_sector(&mut disk).unwrap());
}

/// Minimal-mode transfers only need the tracks something actually uses.
#[test]
fn used_tracks_cover_system_and_files_only() {
    init();
    let disk = load_disk(&build_720k_image(false, &[(3, 2500)]));
    let mut fs = Fat12FileSystem::with_format(
        Fat12Variant::Pc,
        Format::from_size(737_280).unwrap(),
    );
    fs.bpb = BiosParameterBlock {
        res_sectors: 1,
        fats: 2,
        fat_secs: 3,
        root_dir_ents: 0x70,
        sec_per_clust: 2,
        ..BiosParameterBlock::default()
    };
    fs.analyse_fat_sectors(&disk).unwrap();

    let used = fs.used_tracks();
    // Track (0,0) holds everything down to the first data clusters.
    assert!(used.contains(&fluxmend::CylHead::new(0, 0)));
    // The far end of an almost-empty disk is untouched.
    assert!(!used.contains(&fluxmend::CylHead::new(79, 1)));
}
