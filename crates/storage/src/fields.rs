//! Field-name catalogue for every table the orchestrator touches.
//!
//! Field names are defined exactly once, here. Backends encode records and
//! patches through these enums, and every write payload passes through
//! [`validate_write`] before it leaves the process: unknown names fail
//! locally with [`StorageError::InvalidFieldName`], formula-derived fields
//! are dropped.

use serde_json::Value;

use crate::error::StorageError;

/// A JSON object keyed by catalogued field names.
pub type FieldMap = serde_json::Map<String, Value>;

/// The tables of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Clients,
    ClientRunResults,
    JobTracking,
    ProductionIssues,
    StackTraces,
}

impl Table {
    pub const ALL: &'static [Table] = &[
        Table::Clients,
        Table::ClientRunResults,
        Table::JobTracking,
        Table::ProductionIssues,
        Table::StackTraces,
    ];

    /// The table name as it exists in the backing store.
    pub const fn name(self) -> &'static str {
        match self {
            Table::Clients => "Clients",
            Table::ClientRunResults => "Client Run Results",
            Table::JobTracking => "Job Tracking",
            Table::ProductionIssues => "Production Issues",
            Table::StackTraces => "Stack Traces",
        }
    }

    /// Look up a field by name: `Some(true)` for a formula field,
    /// `Some(false)` for a writable one, `None` when unknown.
    pub fn classify_field(self, name: &str) -> Option<bool> {
        match self {
            Table::Clients => ClientField::from_name(name).map(ClientField::is_formula),
            Table::ClientRunResults => {
                ClientRunField::from_name(name).map(ClientRunField::is_formula)
            }
            Table::JobTracking => JobTrackingField::from_name(name).map(JobTrackingField::is_formula),
            Table::ProductionIssues => IssueField::from_name(name).map(IssueField::is_formula),
            Table::StackTraces => StackTraceField::from_name(name).map(StackTraceField::is_formula),
        }
    }
}

/// Common surface of the per-table field enums.
pub trait CatalogueField: Copy + 'static {
    const TABLE: Table;

    fn name(self) -> &'static str;

    fn is_formula(self) -> bool;
}

macro_rules! field_catalogue {
    (
        $(#[$meta:meta])*
        $ty:ident in $table:ident {
            $($variant:ident => $name:literal,)*
        }
        formula {
            $($formula:ident => $formula_name:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $ty {
            $($variant,)*
            $($formula,)*
        }

        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant,)* $($ty::$formula,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                    $($ty::$formula => $formula_name,)*
                }
            }

            #[allow(unreachable_patterns)]
            pub const fn is_formula(self) -> bool {
                match self {
                    $($ty::$formula => true,)*
                    _ => false,
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|f| f.name() == name)
            }
        }

        impl CatalogueField for $ty {
            const TABLE: Table = Table::$table;

            fn name(self) -> &'static str {
                $ty::name(self)
            }

            fn is_formula(self) -> bool {
                $ty::is_formula(self)
            }
        }
    };
}

field_catalogue! {
    /// Fields of the read-only `Clients` table.
    ClientField in Clients {
        ClientId => "Client ID",
        ClientName => "Client Name",
        Status => "Status",
        ServiceLevel => "Service Level",
        Stream => "Processing Stream",
        Email => "Client Email Address",
        LastLeadScoring => "Last Lead Scoring",
        LastPostHarvest => "Last Post Harvest",
        LastPostScoring => "Last Post Scoring",
        FeatureFlags => "Feature Flags",
    }
    formula {
        ActiveLeadCount => "Active Lead Count",
    }
}

field_catalogue! {
    /// Fields of the per-client `Client Run Results` table.
    ClientRunField in ClientRunResults {
        RunId => "Run ID",
        ClientId => "Client ID",
        ClientName => "Client Name",
        Status => "Status",
        StartTime => "Start Time",
        EndTime => "End Time",
        ProfilesExamined => "Profiles Examined for Scoring",
        ProfilesScored => "Profiles Successfully Scored",
        ProfileScoringTokens => "Profile Scoring Tokens",
        PostsHarvested => "Total Posts Harvested",
        HarvestActorRunId => "Apify Run ID",
        HarvestActorCost => "Apify API Costs",
        PostsExamined => "Posts Examined for Scoring",
        PostsScored => "Posts Successfully Scored",
        PostScoringTokens => "Post Scoring Tokens",
        Errors => "Errors",
        PostScoringErrors => "Post Scoring Errors",
        SystemNotes => "System Notes",
        ErrorDetails => "Error Details",
    }
    formula {
        Duration => "Duration",
        SuccessRate => "Success Rate",
        PostScoringSuccessRate => "Post Scoring Success Rate",
    }
}

field_catalogue! {
    /// Fields of the aggregate `Job Tracking` table.
    JobTrackingField in JobTracking {
        RunId => "Run ID",
        Status => "Status",
        Stream => "Stream",
        StartTime => "Start Time",
        EndTime => "End Time",
        ClientsProcessed => "Clients Processed",
        ClientsSucceeded => "Clients Succeeded",
        ClientsFailed => "Clients Failed",
        ProfilesScored => "Profiles Successfully Scored",
        PostsHarvested => "Total Posts Harvested",
        PostsScored => "Posts Successfully Scored",
        TokensUsed => "Total Tokens Used",
        SystemNotes => "System Notes",
        ErrorSummary => "Error Summary",
    }
    formula {
        Duration => "Duration",
        SuccessRate => "Success Rate",
    }
}

field_catalogue! {
    /// Fields of the `Production Issues` table.
    IssueField in ProductionIssues {
        Timestamp => "Timestamp",
        Severity => "Severity",
        Pattern => "Pattern Matched",
        ErrorMessage => "Error Message",
        StackTraceId => "Stack Trace",
        RunId => "Run ID",
        ClientId => "Client ID",
        Stream => "Stream",
        RunType => "Run Type",
        Status => "Status",
        CommitHash => "Fixed In Commit",
        FixNotes => "Fix Notes",
        Occurrences => "Occurrences",
    }
    formula {
        AgeDays => "Age (Days)",
    }
}

field_catalogue! {
    /// Fields of the `Stack Traces` large-text table.
    StackTraceField in StackTraces {
        Timestamp => "Timestamp",
        RunId => "Run ID",
        ClientId => "Client ID",
        ErrorMessage => "Error Message",
        StackTrace => "Stack Trace",
    }
    formula {}
}

/// Set a catalogued field on a payload.
pub fn put<F: CatalogueField>(map: &mut FieldMap, field: F, value: impl Into<Value>) {
    map.insert(field.name().to_string(), value.into());
}

/// Validate a write payload against the table's catalogue.
///
/// Unknown field names are rejected; formula fields are removed.
pub fn validate_write(table: Table, fields: FieldMap) -> Result<FieldMap, StorageError> {
    let mut out = FieldMap::new();
    for (name, value) in fields {
        match table.classify_field(&name) {
            None => {
                return Err(StorageError::InvalidFieldName { table, field: name });
            }
            Some(true) => {
                tracing::debug!(table = table.name(), field = %name, "dropping formula field from write");
            }
            Some(false) => {
                out.insert(name, value);
            }
        }
    }
    Ok(out)
}
