use bucket_watch_lambda::adapters::cloudwatch_logs::CloudWatchLogStore;
use bucket_watch_lambda::config::LoggingConfig;
use bucket_watch_lambda::handlers::logging::handle_logging_batch;
use bucket_watch_lambda::handlers::queue_event::{decode_sqs_bodies, is_sqs_event};
use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

async fn handle_request(
    event: LambdaEvent<Value>,
    config: &LoggingConfig,
    client: &aws_sdk_cloudwatchlogs::Client,
) -> Result<Value, Error> {
    if !is_sqs_event(&event.payload) {
        return Err(Error::from("logging expects an SQS event"));
    }
    let bodies = decode_sqs_bodies(&event.payload).map_err(|error| Error::from(error.message))?;

    // A fresh store per invocation keeps the local line cache bounded.
    let logs = CloudWatchLogStore::new(config.log_group_name.clone(), client.clone());
    let summary = handle_logging_batch(&bodies, &logs, Utc::now().timestamp_millis())
        .map_err(|error| Error::from(error.message))?;
    serde_json::to_value(summary)
        .map_err(|error| Error::from(format!("failed to serialize summary: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = LoggingConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let client = aws_sdk_cloudwatchlogs::Client::new(&aws_config);

    let (config, client) = (&config, &client);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, config, client).await
    }))
    .await
}
