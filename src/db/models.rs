/// One decoded sensor message, ready to become a row in `environment`.
///
/// The row's `time` column is not carried here: Postgres assigns `NOW()` at
/// insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub location: String,
    pub room: String,
    pub sensor: String,
    /// Metric name, e.g. `temperature`.
    pub measurement: String,
    pub value: f64,
}
