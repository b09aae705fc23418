/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// The Unix epoch, used for engines that report no definition time.
pub fn epoch() -> Timestamp {
    Timestamp::default()
}
