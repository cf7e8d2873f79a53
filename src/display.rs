/// Hex rendering of opaque key/value bytes for log statements.
pub fn hex(bytes: &[u8]) -> String {
	hex::encode(bytes)
}
