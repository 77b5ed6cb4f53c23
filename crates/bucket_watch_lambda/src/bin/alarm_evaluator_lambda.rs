use aws_sdk_lambda::types::InvocationType;
use bucket_watch_core::alarm::AlarmTransition;
use bucket_watch_core::metric::MetricFilter;
use bucket_watch_lambda::adapters::cloudwatch_logs::CloudWatchLogStore;
use bucket_watch_lambda::adapters::invoke::AlarmAction;
use bucket_watch_lambda::adapters::object_store::ObjectStore;
use bucket_watch_lambda::adapters::s3::S3ObjectStore;
use bucket_watch_lambda::config::AlarmEvaluatorConfig;
use bucket_watch_lambda::handlers::alarm::{handle_alarm_tick, AlarmTickState, AlarmTickSummary};
use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

/// CloudWatch Logs makes lines searchable a few seconds after they are
/// written; the evaluator stays this far behind the wall clock.
const LOG_INGESTION_DELAY_MS: i64 = 10_000;

struct LambdaCleanerAction {
    lambda_client: aws_sdk_lambda::Client,
    function_name: String,
}

impl AlarmAction for LambdaCleanerAction {
    fn invoke(&self, transition: &AlarmTransition) -> Result<(), String> {
        let payload = serde_json::to_vec(transition)
            .map_err(|error| format!("failed to serialize alarm transition: {error}"))?;
        let client = self.lambda_client.clone();
        let function_name = self.function_name.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                client
                    .invoke()
                    .function_name(function_name)
                    .invocation_type(InvocationType::Event)
                    .set_payload(Some(payload.into()))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|error| format!("failed to invoke cleaner lambda: {error}"))
            })
        })
    }
}

struct RuntimeDependencies {
    config: AlarmEvaluatorConfig,
    filter: MetricFilter,
    logs: CloudWatchLogStore,
    state_store: S3ObjectStore,
    action: LambdaCleanerAction,
}

async fn handle_request(
    _event: LambdaEvent<Value>,
    deps: &RuntimeDependencies,
) -> Result<AlarmTickSummary, Error> {
    let now_ms = Utc::now().timestamp_millis() - LOG_INGESTION_DELAY_MS;
    let persisted = deps
        .state_store
        .get_object(&deps.config.state_key)
        .map_err(Error::from)?;
    let state = AlarmTickState::restore(persisted.as_deref(), deps.config.alarm.clone(), now_ms)
        .map_err(|error| Error::from(error.message))?;

    let tick = handle_alarm_tick(&state, &deps.logs, &deps.filter, now_ms, &deps.action)
        .map_err(|error| Error::from(error.message))?;

    let bytes = tick
        .state
        .to_bytes()
        .map_err(|error| Error::from(error.message))?;
    deps.state_store
        .put_object(&deps.config.state_key, &bytes, Some("application/json"))
        .map_err(Error::from)?;
    // The committed windows are saved; the failed one is retried next tick.
    if let Some(error) = &tick.summary.action_error {
        return Err(Error::from(error.clone()));
    }
    Ok(tick.summary)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = AlarmEvaluatorConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let deps = RuntimeDependencies {
        filter: MetricFilter::default(),
        logs: CloudWatchLogStore::new(
            config.log_group_name.clone(),
            aws_sdk_cloudwatchlogs::Client::new(&aws_config),
        ),
        state_store: S3ObjectStore::new(
            config.state_bucket.clone(),
            aws_sdk_s3::Client::new(&aws_config),
        ),
        action: LambdaCleanerAction {
            lambda_client: aws_sdk_lambda::Client::new(&aws_config),
            function_name: config.cleaner_function_name.clone(),
        },
        config,
    };

    let deps = &deps;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, deps).await
    }))
    .await
}
