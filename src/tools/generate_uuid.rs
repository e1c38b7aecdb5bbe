//! `generate_uuid`: returns a fresh UUID v4.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::Tool;
use crate::error::AppResult;

/// Takes no parameters.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GenerateUuidInput {}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateUuidOutput {
    pub uuid: Uuid,
}

pub struct GenerateUuid;

impl Tool for GenerateUuid {
    type Input = GenerateUuidInput;
    type Output = GenerateUuidOutput;
    const NAME: &'static str = "generate_uuid";

    fn description(&self) -> &'static str {
        "Generate a new UUID v4"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn call(&self, _input: GenerateUuidInput) -> AppResult<GenerateUuidOutput> {
        let uuid = Uuid::new_v4();
        info!(tool = Self::NAME, %uuid, "Generated UUID");
        Ok(GenerateUuidOutput { uuid })
    }
}
