mod common;

use common::*;
use fluxmend::bitstream::builder::generate_bitstream;
use fluxmend::bitstream::scanner::scan_bitstream;
use fluxmend::image::raw::{read_raw, write_regular_disk};
use fluxmend::image::{read_image, write_image};
use fluxmend::track::MergePolicy;
use fluxmend::{CoreOptions, CylHead, DataRate, Encoding, Format};

/// The §8 scenario: a 360K image matches the regular DOS format, and a disk
/// formatted with it round-trips byte for byte.
#[test]
fn format_from_size_360k() {
    init();
    let fmt = Format::from_size(368_640).expect("360K is a known size");
    assert_eq!(fmt.encoding, Encoding::Mfm);
    assert_eq!(fmt.datarate, DataRate::Rate250K);
    assert_eq!((fmt.cyls, fmt.heads, fmt.sectors), (40, 2, 9));
    assert_eq!(fmt.sector_size(), 512);

    let image: Vec<u8> = (0..368_640usize).map(|i| (i % 253) as u8).collect();
    let disk = read_raw(&image, &CoreOptions::default()).unwrap();
    let back = write_regular_disk(&disk, &fmt).unwrap();
    assert_eq!(back, image);
}

/// The same round trip through the extension dispatch tables.
#[test]
fn raw_dispatch_round_trip() {
    init();
    let image: Vec<u8> = (0..368_640usize).map(|i| (i % 89) as u8).collect();
    let disk = read_image("dos360.img", &image, &CoreOptions::default()).unwrap();
    assert_eq!(disk.str_type(), "RAW");
    let back = write_image("copy.img", &disk, &CoreOptions::default()).unwrap();
    assert_eq!(back, image);
}

/// Track → bitstream → track keeps headers and good data, whatever gap
/// bytes the encoder chose.
#[test]
fn track_bitstream_round_trip() {
    init();
    let ch = CylHead::new(7, 1);
    let track = sequential_track(ch, 9);
    let bitbuf = generate_bitstream(&track).unwrap();
    let scanned = scan_bitstream(&bitbuf, ch, &MergePolicy::default()).unwrap();

    assert_eq!(scanned.len(), track.len());
    for (original, decoded) in track.sectors().iter().zip(scanned.sectors()) {
        assert_eq!(original.header, decoded.header);
        assert!(decoded.has_good_data());
        assert_eq!(original.data_best_copy(), decoded.data_best_copy());
    }
}
