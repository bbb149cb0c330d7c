use fluxmend::sector::Sector;
use fluxmend::track::{MergePolicy, Track};
use fluxmend::types::enums::DAM_NORMAL;
use fluxmend::{CylHead, DataRate, Encoding, Header};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A plain nine-sector 512-byte MFM track at the given address.
pub fn sequential_track(cylhead: CylHead, sectors: u8) -> Track {
    let mut track = Track::new();
    track.set_tracklen(100_000);
    let spacing = 100_000 / sectors as u32 / 16 * 16;
    for i in 0..sectors {
        let mut sector = Sector::new(
            DataRate::Rate250K,
            Encoding::Mfm,
            Header::with_cylhead(cylhead, i + 1, 2),
        );
        sector.set_offset(1008 + i as u32 * spacing);
        sector.add(vec![i.wrapping_mul(3); 512], false, DAM_NORMAL);
        track.add(sector, &MergePolicy::default()).unwrap();
    }
    track
}
