mod tests_cursor;
mod tests_varint;
