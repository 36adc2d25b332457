/// Max live appointments held by one store.
pub const MAX_APPOINTMENTS: usize = 1_000_000;

/// Max byte length of any free-text appointment field.
pub const MAX_FIELD_LEN: usize = 64;

/// Max rows returned by one SELECT over the wire.
pub const MAX_RESULT_ROWS: usize = 100_000;

/// Max encoded size of one WAL event. Larger length prefixes are corruption.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Max size of a directory seed file.
pub const MAX_SEED_BYTES: u64 = 64 * 1024 * 1024;
