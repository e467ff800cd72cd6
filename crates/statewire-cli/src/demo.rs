//! Weather demo: a two-step workflow driven by a scripted model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::info;

use statewire_agent::{EmissionPolicy, StepOutput, StepResult, StepRunner};
use statewire_core::config::{Config, EmitRule};
use statewire_core::error::Result;
use statewire_core::session::SessionId;
use statewire_core::shape::{ShapeSchema, ValueType};
use statewire_core::state::{FieldSpec, StateContainer, StateSchema};
use statewire_gateway::{GatewayState, SessionEntry};

pub const DEMO_SESSION: &str = "demo";

pub fn weather_shape() -> ShapeSchema {
    ShapeSchema::new("WeatherResponse")
        .field("conditions", ValueType::String)
        .field("temperature", ValueType::Number)
        .field("wind_direction", ValueType::String)
        .field("wind_speed", ValueType::Number)
}

/// Configured emission rules, plus the forecast rule the demo relies on.
fn weather_policy(config: &Config) -> EmissionPolicy {
    let mut emission = config.emission();
    let has_rule = emission
        .emit_intermediate_state
        .iter()
        .any(|r| r.match_shape == "WeatherResponse");
    if !has_rule {
        emission
            .emit_intermediate_state
            .push(EmitRule::new("final_response", "WeatherResponse"));
    }
    EmissionPolicy::new(emission, config.messages_field())
}

pub async fn open_demo_session(state: &GatewayState) -> Result<SessionEntry> {
    let schema = StateSchema::new()
        .field(
            "final_response",
            FieldSpec::overwrite(ValueType::shape("WeatherResponse")),
            Value::Null,
        )
        .field("input", FieldSpec::overwrite(ValueType::String), json!("nyc"))
        .field(
            state.config.messages_field(),
            FieldSpec::append_only(ValueType::Any),
            Value::Null,
        );
    let initial = StateContainer::from_schema(&schema, &state.shapes)?;
    state
        .open_session(SessionId::from(DEMO_SESSION), initial, weather_policy(&state.config))
        .await
}

/// Stand-in for the model call: a fixed forecast per city.
fn forecast(city: &str) -> Value {
    const CONDITIONS: [&str; 4] = ["cloudy", "sunny", "rainy", "windy"];
    const DIRECTIONS: [&str; 4] = ["NE", "SW", "NW", "SE"];
    if city.eq_ignore_ascii_case("nyc") {
        return json!({
            "conditions": "cloudy",
            "temperature": 70,
            "wind_direction": "NE",
            "wind_speed": 5
        });
    }
    let h = city.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    json!({
        "conditions": CONDITIONS[h % 4],
        "temperature": 50 + (h % 40),
        "wind_direction": DIRECTIONS[(h / 4) % 4],
        "wind_speed": 1 + (h % 20)
    })
}

async fn report(runner: &StepRunner, delay: Duration) -> Result<()> {
    runner
        .run_step("acknowledge", |state| async move {
            let city = state.get("input").and_then(Value::as_str).unwrap_or("nowhere").to_string();
            Ok(StepResult::single(StepOutput::assistant(format!(
                "Let me check the weather in {city}."
            ))))
        })
        .await?;

    runner
        .run_step("call_model", |state| async move {
            tokio::time::sleep(delay).await;
            let city = state.get("input").and_then(Value::as_str).unwrap_or("nowhere").to_string();
            // The model weighs a tool call before settling on a structured answer.
            Ok(StepResult::choose(
                vec![
                    StepOutput::ToolCall {
                        name: "search".into(),
                        arguments: json!({"query": format!("weather {city}")}),
                    },
                    StepOutput::structured("WeatherResponse", forecast(&city)),
                ],
                1,
            ))
        })
        .await
}

/// Run the workflow. With `wait_for` set, the session then awaits a new
/// `input` from a client for that long and reports again for each one.
pub async fn run_weather_workflow(
    runner: Arc<StepRunner>,
    delay: Duration,
    wait_for: Option<Duration>,
) -> Result<()> {
    runner.start().await?;
    report(&runner, delay).await?;

    if let Some(idle) = wait_for {
        loop {
            match tokio::time::timeout(idle, runner.wait_for_input()).await {
                Ok(accepted) => {
                    info!(overrides = accepted?.len(), "Input received, reporting again");
                    report(&runner, delay).await?;
                }
                Err(_) => {
                    info!("No input within {idle:?}, finishing");
                    break;
                }
            }
        }
    }

    runner.complete().await
}
