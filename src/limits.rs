//! Hard caps on free-text input. Exceeding any of them is `LIMIT_EXCEEDED`.

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_FEEDBACK_LEN: usize = 1000;
pub const MAX_NOTES_LEN: usize = 1000;

/// Rows accepted in one `INSERT ... VALUES`.
pub const MAX_INSERT_ROWS: usize = 1;
