//! Hard resource caps. Requests past these fail loudly instead of
//! degrading the whole process.

/// RFC 5321 path limit.
pub const MAX_EMAIL_LEN: usize = 254;

pub const MAX_NAME_LEN: usize = 120;

pub const MAX_DESCRIPTION_LEN: usize = 2000;

/// Distinct identities a single store will hold.
pub const MAX_IDENTITIES: usize = 100_000;

/// Bookings (past + future) kept per identity.
pub const MAX_BOOKINGS_PER_IDENTITY: usize = 64;

/// How far ahead a booking date may lie, in days.
pub const MAX_DAYS_AHEAD: i64 = 730;

/// Entries allowed per survey answer list.
pub const MAX_SURVEY_CHOICES: usize = 16;

/// Length cap for any single survey answer, including `other_goal`.
pub const MAX_SURVEY_ANSWER_LEN: usize = 200;
