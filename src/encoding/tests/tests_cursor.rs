use crate::encoding::{put_u32_le, put_u64_le, Cursor, EncodingError};

#[test]
fn cursor_reads_mixed_fields() {
    let mut buf = Vec::new();
    buf.push(0x07);
    put_u32_le(0xdead_beef, &mut buf);
    put_u64_le(42, &mut buf);
    buf.extend_from_slice(b"tail");

    let mut cur = Cursor::new(&buf);
    assert_eq!(cur.read_u8().unwrap(), 0x07);
    assert_eq!(cur.read_u32_le().unwrap(), 0xdead_beef);
    assert_eq!(cur.read_u64_le().unwrap(), 42);
    assert_eq!(cur.read_bytes(4).unwrap(), b"tail");
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn cursor_align4_rounds_up() {
    let buf = [0u8; 16];
    let mut cur = Cursor::new(&buf);
    cur.read_u8().unwrap();
    cur.align4();
    assert_eq!(cur.position(), 4);
    cur.align4();
    assert_eq!(cur.position(), 4);
}

#[test]
fn cursor_eof_reports_shortfall() {
    let buf = [1u8, 2];
    let mut cur = Cursor::new(&buf);
    match cur.read_u64_le() {
        Err(EncodingError::UnexpectedEof { needed, available }) => {
            assert_eq!(needed, 8);
            assert_eq!(available, 2);
        }
        other => panic!("expected eof, got {other:?}"),
    }
}
