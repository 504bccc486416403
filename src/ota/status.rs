use serde::Serialize;
use update_core::UpdateReport;

/// Body of `GET /api/ota/status`
#[derive(Debug, Clone, Serialize)]
pub struct OtaStatus {
    /// An upload currently holds the flash
    pub busy: bool,
    pub running_partition: Option<String>,
    pub last_update: Option<UpdateReport>,
}

impl OtaStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize OTA status: {}", e);
            r#"{"busy":false}"#.to_string()
        })
    }
}
