//! Sea-query column identifiers for the job configuration table.
//!
//! The table name is deployment configuration, so it is supplied at runtime
//! as an `Alias`; only the columns are fixed here.

use sea_query::Iden;

#[derive(Iden, Clone, Copy)]
pub enum JobColumn {
    RunId,
    RunName,
    RunDuration,
    OutputFrequency,
    Srid,
    Resolution,
    DomainTable,
    DomainId,
    DemTable,
    RainTable,
    RainStart,
    RainEnd,
    RainTotal,
    RainDuration,
    Friction,
    GreenAreasTable,
    BuildingsTable,
    UploadUrl,
    Hostname,
    VersionNumber,
    RunStart,
    RunEnd,
}

impl JobColumn {
    /// Every column, in table order.
    pub const ALL: [JobColumn; 22] = [
        JobColumn::RunId,
        JobColumn::RunName,
        JobColumn::RunDuration,
        JobColumn::OutputFrequency,
        JobColumn::Srid,
        JobColumn::Resolution,
        JobColumn::DomainTable,
        JobColumn::DomainId,
        JobColumn::DemTable,
        JobColumn::RainTable,
        JobColumn::RainStart,
        JobColumn::RainEnd,
        JobColumn::RainTotal,
        JobColumn::RainDuration,
        JobColumn::Friction,
        JobColumn::GreenAreasTable,
        JobColumn::BuildingsTable,
        JobColumn::UploadUrl,
        JobColumn::Hostname,
        JobColumn::VersionNumber,
        JobColumn::RunStart,
        JobColumn::RunEnd,
    ];
}
