mod common;

use common::*;
use fluxmend::disk::{DemandDisk, TrackLoader};
use fluxmend::normalise::NormaliseContext;
use fluxmend::opts::RetryMode;
use fluxmend::track::Track;
use fluxmend::{
    transfer_disk, transfer_track, CoreOptions, CylHead, DeviceReadingPolicy, Disk, RetryPolicy,
    TrackData, TransferMode,
};

/// A device source that records every acquisition request.
struct RecordingLoader {
    loads: Vec<(CylHead, bool, Option<u16>)>,
    bad_sector_until: usize,
}

impl TrackLoader for RecordingLoader {
    fn load(
        &mut self,
        cylhead: CylHead,
        first_read: bool,
        with_head_seek_to: Option<u16>,
        _policy: &DeviceReadingPolicy,
    ) -> Result<TrackData, fluxmend::DiskError> {
        self.loads.push((cylhead, first_read, with_head_seek_to));
        let mut track = sequential_track(cylhead, 9);
        if self.loads.len() <= self.bad_sector_until {
            // One sector stays bad until the drive has warmed up.
            let data = track.sector(4).data_best_copy().unwrap().clone();
            track.sector_mut(4).replace_data(data, true);
        }
        Ok(TrackData::from_track(cylhead, track))
    }

    fn cyls(&self) -> u16 {
        40
    }
}

/// Retried reads alternate the head seek around the target cylinder to
/// exercise the stepper: -1 (none), C+1, C-1, C+1.
#[test]
fn retry_head_seek_alternation() {
    init();
    let loader = RecordingLoader {
        loads: Vec::new(),
        bad_sector_until: usize::MAX,
    };
    let mut src = DemandDisk::new(loader, RetryPolicy::default(), RetryPolicy::default());
    let mut dst = Disk::new();
    let opts = CoreOptions {
        track_retries: RetryMode::Count(3),
        ..CoreOptions::default()
    };
    let cylhead = CylHead::new(10, 0);
    let mut policy = DeviceReadingPolicy::default();
    let mut ctx = NormaliseContext::new();

    transfer_track(
        &mut src,
        cylhead,
        &mut dst,
        TransferMode::Repair,
        false,
        &mut policy,
        &opts,
        None,
        &mut ctx,
    )
    .unwrap();

    let seeks: Vec<Option<u16>> = src.loader().loads.iter().map(|l| l.2).collect();
    assert_eq!(seeks, vec![None, Some(11), Some(9), Some(11)]);
}

#[test]
fn head_seek_clamps_at_cylinder_zero() {
    init();
    let loader = RecordingLoader {
        loads: Vec::new(),
        bad_sector_until: usize::MAX,
    };
    let mut src = DemandDisk::new(loader, RetryPolicy::default(), RetryPolicy::default());
    let mut dst = Disk::new();
    let opts = CoreOptions {
        track_retries: RetryMode::Count(2),
        ..CoreOptions::default()
    };
    let mut policy = DeviceReadingPolicy::default();
    let mut ctx = NormaliseContext::new();

    transfer_track(
        &mut src,
        CylHead::new(0, 0),
        &mut dst,
        TransferMode::Repair,
        false,
        &mut policy,
        &opts,
        None,
        &mut ctx,
    )
    .unwrap();

    let seeks: Vec<Option<u16>> = src.loader().loads.iter().map(|l| l.2).collect();
    assert_eq!(seeks, vec![None, Some(1), Some(0)]);
}

/// Repair mode accumulates improvements until the source finally yields a
/// good copy of the weak sector.
#[test]
fn repair_rounds_fix_the_destination() {
    init();
    let loader = RecordingLoader {
        loads: Vec::new(),
        bad_sector_until: 2,
    };
    let mut src = DemandDisk::new(loader, RetryPolicy::default(), RetryPolicy::default());
    let mut dst = Disk::new();
    let opts = CoreOptions {
        track_retries: RetryMode::Count(3),
        ..CoreOptions::default()
    };
    let cylhead = CylHead::new(5, 0);
    let mut policy = DeviceReadingPolicy::default();
    let mut ctx = NormaliseContext::new();

    transfer_track(
        &mut src,
        cylhead,
        &mut dst,
        TransferMode::Repair,
        false,
        &mut policy,
        &opts,
        None,
        &mut ctx,
    )
    .unwrap();

    let repaired = dst.read_track(cylhead).unwrap();
    assert!(repaired.has_all_good_data());
}

/// A copy transfer of a whole constant disk is a plain copy, with no retry
/// rounds wasted on a source that cannot change.
#[test]
fn constant_source_copies_without_retries() {
    init();
    let mut src = Disk::new();
    for cyl in 0..3u16 {
        for head in 0..2u8 {
            let ch = CylHead::new(cyl, head);
            src.write_track(ch, sequential_track(ch, 9));
        }
    }
    let mut dst = Disk::new();
    let opts = CoreOptions {
        disk_retries: RetryMode::Count(5),
        ..CoreOptions::default()
    };
    let changed = transfer_disk(&mut src, &mut dst, &opts, None).unwrap();
    assert_eq!(changed, 0); // a clean copy needs no repairs
    assert_eq!(dst.cyls(), 3);
    assert_eq!(dst.heads(), 2);
    let track = dst.read_track(CylHead::new(2, 1)).unwrap();
    assert_eq!(track.len(), 9);
    assert!(track.has_all_good_data());
}

/// Strict normal-disk mode passes clean tracks through and surfaces
/// repeated sector ids as the distinct error kind.
#[test]
fn strict_mode_rejects_repeated_sectors() {
    init();
    let ch = CylHead::new(0, 0);
    let mut src = Disk::new();
    let mut track = sequential_track(ch, 8);
    let mut repeat = fluxmend::Sector::new(
        fluxmend::DataRate::Rate250K,
        fluxmend::Encoding::Mfm,
        fluxmend::Header::with_cylhead(ch, 3, 2),
    );
    repeat.set_offset(95_008);
    repeat.add(vec![0xAA; 512], false, fluxmend::types::enums::DAM_NORMAL);
    track
        .add(repeat, &fluxmend::track::MergePolicy::default())
        .unwrap();
    src.write_track(ch, track);

    let opts = CoreOptions {
        normal_disk: true,
        ..CoreOptions::default()
    };
    let mut dst = Disk::new();
    let mut policy = DeviceReadingPolicy::default();
    let mut ctx = NormaliseContext::new();
    let err = transfer_track(
        &mut src,
        ch,
        &mut dst,
        TransferMode::Copy,
        false,
        &mut policy,
        &opts,
        None,
        &mut ctx,
    )
    .unwrap_err();
    assert!(matches!(err, fluxmend::DiskError::RepeatedSector { id: 3 }));

    // A clean source passes untouched.
    let ch2 = CylHead::new(1, 0);
    src.write_track(ch2, sequential_track(ch2, 9));
    transfer_track(
        &mut src,
        ch2,
        &mut dst,
        TransferMode::Copy,
        false,
        &mut policy,
        &opts,
        None,
        &mut ctx,
    )
    .unwrap();
    assert_eq!(dst.read_track(ch2).unwrap().len(), 9);
}

/// A repair transfer never loses good sectors, whatever the source holds.
#[test]
fn repair_transfer_is_monotone() {
    init();
    let ch = CylHead::new(0, 0);
    let mut src = Disk::new();
    let mut src_track = Track::new();
    src_track.set_tracklen(100_000);
    // Source has only a bad rendition of sector 3.
    {
        let full = sequential_track(ch, 9);
        for (i, sector) in full.sectors().iter().enumerate() {
            let mut s = sector.clone();
            if i == 2 {
                let data = s.data_best_copy().unwrap().clone();
                s.replace_data(data, true);
            }
            src_track
                .add(s, &fluxmend::track::MergePolicy::default())
                .unwrap();
        }
    }
    src.write_track(ch, src_track);

    let mut dst = Disk::new();
    dst.write_track(ch, sequential_track(ch, 9));
    let good_before = dst.read_track(ch).unwrap().good_sectors().len();

    let opts = CoreOptions::default();
    let mut policy = DeviceReadingPolicy::default();
    let mut ctx = NormaliseContext::new();
    transfer_track(
        &mut src,
        ch,
        &mut dst,
        TransferMode::Repair,
        false,
        &mut policy,
        &opts,
        None,
        &mut ctx,
    )
    .unwrap();

    let good_after = dst.read_track(ch).unwrap().good_sectors().len();
    assert!(good_after >= good_before);
}
