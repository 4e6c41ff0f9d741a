use serde::{Deserialize, Serialize};

/// Data token exchanged between agents.
///
/// Agents declare the tokens they depend on and the tokens they provide; the
/// planner orders agents so every dependency is available before it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataToken {
    /// No dependency. Always satisfied.
    None,
    /// Vendor identity (name, vendor number, remit-to).
    VendorInfo,
    /// Correspondence pulled from the mailbox.
    EmailData,
    /// Accounts-payable records (invoices, POs, payments).
    ApData,
    /// CRM account data.
    CrmData,
    /// Aggregate of every data source.
    AllData,
    /// Execution plan produced by the coordinator.
    ExecutionPlan,
    /// Final investigation report.
    AnalysisReport,
}

impl DataToken {
    /// Tokens that mark an agent as a data provider.
    pub const DATA_SOURCES: [DataToken; 3] =
        [DataToken::EmailData, DataToken::ApData, DataToken::CrmData];

    /// Whether this token is produced by one of the data systems.
    pub fn is_data_source(self) -> bool {
        Self::DATA_SOURCES.contains(&self)
    }
}

impl std::fmt::Display for DataToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataToken::None => "NONE",
            DataToken::VendorInfo => "VENDOR_INFO",
            DataToken::EmailData => "EMAIL_DATA",
            DataToken::ApData => "AP_DATA",
            DataToken::CrmData => "CRM_DATA",
            DataToken::AllData => "ALL_DATA",
            DataToken::ExecutionPlan => "EXECUTION_PLAN",
            DataToken::AnalysisReport => "ANALYSIS_REPORT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_sources() {
        assert!(DataToken::EmailData.is_data_source());
        assert!(DataToken::CrmData.is_data_source());
        assert!(!DataToken::VendorInfo.is_data_source());
        assert!(!DataToken::AllData.is_data_source());
    }
}
