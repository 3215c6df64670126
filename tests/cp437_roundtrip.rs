//! CP437 transcoder properties.

use telbbs::bbs::encoding::{decode_cp437, encode_cp437, Encoding, CP437};

#[test]
fn table_glyphs_round_trip_except_the_stripped_pair() {
    let glyphs: String = CP437
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != 14 && *idx != 15)
        .map(|(_, glyph)| glyph)
        .collect();
    let encoded = encode_cp437(&glyphs);
    assert_eq!(decode_cp437(&encoded), glyphs);
}

#[test]
fn stripped_glyphs_vanish_on_encode() {
    let encoded = encode_cp437(&format!("a{}{}z", CP437[14], CP437[15]));
    assert_eq!(encoded, b"az".to_vec());
}

#[test]
fn ansi_art_uses_classic_shaded_blocks() {
    // the original shaded block for cp437 terminals
    assert_eq!(encode_cp437("░"), vec![0xb0]);
    assert_eq!(encode_cp437("┌─┐"), vec![0xda, 0xc4, 0xbf]);
}

#[test]
fn non_table_latin1_falls_back_to_its_low_byte() {
    // ã has no cp437 glyph; its latin-1 byte goes through untouched
    assert_eq!(encode_cp437("ã"), vec![0xe3]);
    // anything above latin-1 without a glyph degrades to '?'
    assert_eq!(encode_cp437("€"), b"?".to_vec());
}

#[test]
fn control_bytes_for_the_stripped_pair_never_reach_the_wire() {
    let encoded = encode_cp437("a\u{0e}b\u{0f}c");
    assert_eq!(encoded, b"abc".to_vec());
}

#[test]
fn utf8_mode_passes_text_through() {
    let text = "░ naïve café ░";
    assert_eq!(Encoding::Utf8.encode(text), text.as_bytes().to_vec());
}

#[test]
fn encoding_mode_selects_the_transcoder() {
    assert_eq!(Encoding::Cp437.encode("░"), vec![0xb0]);
    assert_eq!(Encoding::Utf8.encode("░"), "░".as_bytes().to_vec());
}

#[test]
fn only_two_encodings_parse() {
    assert!("utf8".parse::<Encoding>().is_ok());
    assert!("cp437".parse::<Encoding>().is_ok());
    assert!("latin-1".parse::<Encoding>().is_err());
}
