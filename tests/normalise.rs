mod common;

use common::*;
use fluxmend::messages::{drain, MessageKind};
use fluxmend::normalise::{normalise_track, NormaliseContext};
use fluxmend::sector::Sector;
use fluxmend::track::{MergePolicy, RepeatedSectors, Track};
use fluxmend::types::enums::{FixMode, DAM_NORMAL};
use fluxmend::{CoreOptions, CylHead, DataRate, DiskError, Encoding, Header};

fn speedlock_track() -> Track {
    let ch = CylHead::new(0, 0);
    let mut track = Track::new();
    track.set_tracklen(100_000);
    for i in 0..9u8 {
        let mut sector = Sector::new(
            DataRate::Rate250K,
            Encoding::Mfm,
            Header::with_cylhead(ch, i + 1, 2),
        );
        sector.set_offset(1008 + i as u32 * 11_008);
        let mut data = vec![0x51u8; 512];
        if i == 0 {
            data[304..313].copy_from_slice(b"SPEEDLOCK");
        }
        sector.add(data, i == 1, DAM_NORMAL);
        track.add(sector, &MergePolicy::default()).unwrap();
    }
    track
}

/// The §8 Speedlock scenario with fixes enabled: a second copy appears with
/// bytes inverted from the weak offset onward, flagged as a data CRC error.
#[test]
fn speedlock_fix_synthesises_weak_copy() {
    init();
    drain();
    let mut track = speedlock_track();
    let opts = CoreOptions::default();
    let mut ctx = NormaliseContext::new();
    let changed = normalise_track(CylHead::new(0, 0), &mut track, &opts, &mut ctx);
    assert!(changed);

    let weak = track.sector(1);
    assert_eq!(weak.copies(), 2);
    assert!(weak.has_baddatacrc());
    let first = weak.data_copy(0);
    let second = weak.data_copy(1);
    assert_eq!(&first[..336], &second[..336]);
    for (a, b) in first[336..].iter().zip(second[336..].iter()) {
        assert_eq!(*a, !*b);
    }

    let fixes: Vec<_> = drain()
        .into_iter()
        .filter(|(kind, _)| *kind == MessageKind::Fix)
        .collect();
    assert_eq!(fixes.len(), 1);
}

/// With fixes disabled a single warning is emitted and nothing changes.
#[test]
fn speedlock_warn_mode_reports_once() {
    init();
    drain();
    let mut track = speedlock_track();
    let opts = CoreOptions {
        fix: FixMode::Warn,
        ..CoreOptions::default()
    };
    let mut ctx = NormaliseContext::new();
    normalise_track(CylHead::new(0, 0), &mut track, &opts, &mut ctx);
    assert_eq!(track.sector(1).copies(), 1);

    let warnings: Vec<_> = drain()
        .into_iter()
        .filter(|(kind, text)| *kind == MessageKind::Warning && text.contains("Speedlock"))
        .collect();
    assert_eq!(warnings.len(), 1);
}

/// The §8 repeated-sector scenario: two non-orphan sectors share header
/// (0,0,3,2) at offsets 1600 and 51200; strict validation raises the
/// repeated-sector kind carrying the offending id.
#[test]
fn repeated_sector_is_a_distinct_error_kind() {
    init();
    let mut track = Track::new();
    track.set_tracklen(100_000);
    for offset in [1600u32, 51_200] {
        let mut sector = Sector::new(
            DataRate::Rate250K,
            Encoding::Mfm,
            Header::new(0, 0, 3, 2),
        );
        sector.set_offset(offset);
        sector.add(vec![0u8; 512], false, DAM_NORMAL);
        track.add(sector, &MergePolicy::default()).unwrap();
    }

    let err = track
        .validate(&RepeatedSectors::default(), 64)
        .unwrap_err();
    match err {
        DiskError::RepeatedSector { id } => assert_eq!(id, 3),
        other => panic!("expected RepeatedSector, got {other:?}"),
    }

    // The caller may collect the repeats and accept the track anyway.
    let mut repeated = RepeatedSectors::default();
    track.collect_repeated_sector_ids_into(&mut repeated);
    assert!(track.validate(&repeated, 64).is_ok());
}

/// Deleting any single sector from a complete sequential track leaves a
/// hole the scheme discovery names exactly.
#[test]
fn scheme_discovery_names_the_missing_sector() {
    init();
    let ch = CylHead::new(2, 0);
    for removed in 0..9usize {
        let full = sequential_track(ch, 9);
        let mut partial = Track::new();
        partial.set_tracklen(full.tracklen);
        for (i, sector) in full.sectors().iter().enumerate() {
            if i != removed {
                partial
                    .add(sector.clone(), &MergePolicy::default())
                    .unwrap();
            }
        }
        assert!(partial.discover_sector_scheme(&RepeatedSectors::default(), true, 64));
        assert_eq!(partial.missing_sector_ids(), vec![removed as u8 + 1]);
    }
}
