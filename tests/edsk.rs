mod common;

use common::*;
use fluxmend::image::edsk::{read_edsk, write_edsk, write_rdsk, read_rdsk};
use fluxmend::sector::Sector;
use fluxmend::track::MergePolicy;
use fluxmend::types::enums::{DAM_DELETED, DAM_NORMAL};
use fluxmend::{CoreOptions, CylHead, DataRate, Disk, Encoding, Header};

/// A disk exercising the interesting EDSK shapes: weak multi-copy data, a
/// deleted mark, a bad ID, and known offsets.
fn protected_disk() -> Disk {
    let mut disk = Disk::new();

    let ch0 = CylHead::new(0, 0);
    let mut track0 = sequential_track(ch0, 9);
    {
        // Sector index 1 becomes weak: two differing copies, bad data CRC.
        let weak = track0.sector_mut(1);
        let data = weak.data_best_copy().unwrap().clone();
        let mut second = data.clone();
        for byte in second.iter_mut().skip(336) {
            *byte = !*byte;
        }
        weak.replace_data(data, true);
        weak.add(second, true, DAM_NORMAL);

        track0.sector_mut(3).dam = DAM_DELETED;
    }
    disk.write_track(ch0, track0);

    let ch1 = CylHead::new(0, 1);
    let mut track1 = sequential_track(ch1, 9);
    {
        // A sector whose ID never read cleanly carries no data.
        let bad_id = track1.sector_mut(5);
        bad_id.remove_data();
        bad_id.set_badidcrc();
    }
    disk.write_track(ch1, track1);

    disk
}

#[test]
fn edsk_round_trip_is_identity() {
    init();
    let disk = protected_disk();
    let bytes = write_edsk(&disk, &CoreOptions::default()).unwrap();
    let back = read_edsk(&bytes, &CoreOptions::default()).unwrap();
    assert_eq!(back.str_type(), "EDSK");
    assert_eq!(back.cyls(), disk.cyls());
    assert_eq!(back.heads(), disk.heads());

    for cylhead in [CylHead::new(0, 0), CylHead::new(0, 1)] {
        let original = disk.read_track(cylhead).unwrap();
        let decoded = back.read_track(cylhead).unwrap();
        assert_eq!(original.len(), decoded.len());
        assert_eq!(original.tracklen, decoded.tracklen);
        for (a, b) in original.sectors().iter().zip(decoded.sectors()) {
            assert_eq!(a.header, b.header);
            assert_eq!(a.has_badidcrc(), b.has_badidcrc());
            assert_eq!(a.has_baddatacrc(), b.has_baddatacrc());
            assert_eq!(a.is_deleted(), b.is_deleted());
            assert_eq!(a.copies(), b.copies());
            for i in 0..a.copies() {
                assert_eq!(a.data_copy(i), b.data_copy(i));
            }
            assert_eq!(a.offset(), b.offset());
        }
    }
}

#[test]
fn weak_sector_encodes_as_multi_copy_record() {
    init();
    let disk = protected_disk();
    let bytes = write_edsk(&disk, &CoreOptions::default()).unwrap();

    // Track 0's block starts right after the 256-byte header; the weak
    // sector (index 1) record sits in its sector index.
    let record = &bytes[256 + 24 + 8..256 + 24 + 16];
    let status2 = record[5];
    let data_len = u16::from_le_bytes([record[6], record[7]]);
    assert_eq!(status2 & 0x20, 0x20);
    assert_eq!(data_len, 1024);

    let back = read_edsk(&bytes, &CoreOptions::default()).unwrap();
    let track = back.read_track(CylHead::new(0, 0)).unwrap();
    let weak = track.sector(1);
    assert_eq!(weak.copies(), 2);
    assert_eq!(weak.data_copy(0).len(), 512);
    assert_eq!(weak.data_copy(1).len(), 512);
    assert!(weak.has_baddatacrc());
}

#[test]
fn rdsk_preserves_read_statistics() {
    init();
    let mut disk = Disk::new();
    let ch = CylHead::new(0, 0);
    let mut track = sequential_track(ch, 9);
    {
        let sector = track.sector_mut(2);
        sector.set_read_attempts(7);
        sector.set_read_count_of_copy(0, 5);
    }
    disk.write_track(ch, track);

    let bytes = write_rdsk(&disk, &CoreOptions::default()).unwrap();
    let back = read_rdsk(&bytes, &CoreOptions::default()).unwrap();
    assert_eq!(back.str_type(), "RDSK");
    let track = back.read_track(ch).unwrap();
    assert_eq!(track.sector(2).read_attempts(), 7);
    assert_eq!(track.sector(2).read_count_of_copy(0), 5);
}

#[test]
fn foreign_signature_is_rejected() {
    init();
    let mut bytes = write_edsk(&protected_disk(), &CoreOptions::default()).unwrap();
    bytes[0] = b'X';
    assert!(read_edsk(&bytes, &CoreOptions::default()).is_err());
}

#[test]
fn dummy_trailing_byte_marks_gap_extended_bad_sector() {
    init();
    let mut disk = Disk::new();
    let ch = CylHead::new(0, 0);
    let mut track = sequential_track(ch, 9);
    {
        // A single bad copy of exactly twice the native size would read
        // back as two copies without the marker byte.
        let sector = track.sector_mut(4);
        sector.replace_data(vec![0x11; 1024], true);
    }
    disk.write_track(ch, track);

    let bytes = write_edsk(&disk, &CoreOptions::default()).unwrap();
    let record = &bytes[256 + 24 + 8 * 4..256 + 24 + 8 * 5];
    let data_len = u16::from_le_bytes([record[6], record[7]]);
    assert_eq!(data_len, 1025);

    let back = read_edsk(&bytes, &CoreOptions::default()).unwrap();
    let sector_back = back.read_track(ch).unwrap().sector(4).clone();
    assert_eq!(sector_back.copies(), 1);
    assert_eq!(sector_back.data_copy(0).len(), 1024);
}

#[test]
fn dispatch_reads_edsk_by_extension() {
    init();
    let disk = protected_disk();
    let bytes = write_edsk(&disk, &CoreOptions::default()).unwrap();
    let back = fluxmend::image::read_image("dump.dsk", &bytes, &CoreOptions::default()).unwrap();
    assert_eq!(back.str_type(), "EDSK");
}

#[test]
fn repeated_sector_ids_survive_the_image() {
    init();
    // Copy-protected disks may carry the same id twice on one track.
    let mut disk = Disk::new();
    let ch = CylHead::new(0, 0);
    let mut track = sequential_track(ch, 8);
    let mut repeat = Sector::new(
        DataRate::Rate250K,
        Encoding::Mfm,
        Header::with_cylhead(ch, 3, 2),
    );
    repeat.set_offset(95_008);
    repeat.add(vec![0xAA; 512], false, DAM_NORMAL);
    track.add(repeat, &MergePolicy::default()).unwrap();
    disk.write_track(ch, track);

    let bytes = write_edsk(&disk, &CoreOptions::default()).unwrap();
    let back = read_edsk(&bytes, &CoreOptions::default()).unwrap();
    let track = back.read_track(ch).unwrap();
    assert_eq!(track.len(), 9);
    let id3: Vec<_> = track
        .sectors()
        .iter()
        .filter(|s| s.header.sector == 3)
        .collect();
    assert_eq!(id3.len(), 2);
}
