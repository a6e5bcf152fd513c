use crate::encoding::{
    get_varint32, get_varint64, put_varint32, put_varint64, EncodingError, MAX_VARINT32_LEN,
};

#[test]
fn varint32_width_boundaries() {
    // One extra byte per 7 bits of payload.
    let cases: &[(u32, usize)] = &[
        (0, 1),
        (0x7f, 1),
        (0x80, 2),
        (0x3fff, 2),
        (0x4000, 3),
        (0x1f_ffff, 3),
        (0x20_0000, 4),
        (0xfff_ffff, 4),
        (0x1000_0000, 5),
        (u32::MAX, 5),
    ];
    for &(value, width) in cases {
        let mut buf = Vec::new();
        let n = put_varint32(value, &mut buf);
        assert_eq!(n, width, "width of {value:#x}");
        assert_eq!(buf.len(), width);
        let (decoded, used) = get_varint32(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(used, width);
    }
}

#[test]
fn varint_single_byte_layout() {
    let mut buf = Vec::new();
    put_varint32(0x05, &mut buf);
    assert_eq!(buf, [0x05]);

    // 0x80 = high group 0x01 with continuation, low group 0x00.
    buf.clear();
    put_varint32(0x80, &mut buf);
    assert_eq!(buf, [0x81, 0x00]);
}

#[test]
fn varint64_round_trip() {
    for value in [0u64, 1, 300, 1 << 35, u64::from(u32::MAX) + 17, u64::MAX] {
        let mut buf = Vec::new();
        put_varint64(value, &mut buf);
        let (decoded, used) = get_varint64(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(used, buf.len());
    }
}

#[test]
fn varint_decode_ignores_trailing_bytes() {
    let mut buf = Vec::new();
    put_varint32(1234, &mut buf);
    buf.extend_from_slice(&[0xde, 0xad]);
    let (decoded, used) = get_varint32(&buf).unwrap();
    assert_eq!(decoded, 1234);
    assert_eq!(used, buf.len() - 2);
}

#[test]
fn varint_truncated_is_eof() {
    let mut buf = Vec::new();
    put_varint32(u32::MAX, &mut buf);
    buf.pop();
    assert!(matches!(
        get_varint32(&buf),
        Err(EncodingError::UnexpectedEof { .. })
    ));
}

#[test]
fn varint_unterminated_is_overflow() {
    let buf = [0xffu8; MAX_VARINT32_LEN + 2];
    assert!(matches!(
        get_varint32(&buf),
        Err(EncodingError::VarintOverflow(_))
    ));
}
