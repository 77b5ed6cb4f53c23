use bucket_watch_core::contract::DEFAULT_INDEX_NAME;
use bucket_watch_lambda::adapters::dynamodb::DynamoAggregationTable;
use bucket_watch_lambda::config::SizeTrackingConfig;
use bucket_watch_lambda::handlers::queue_event::{decode_sqs_bodies, is_sqs_event};
use bucket_watch_lambda::handlers::size_tracking::handle_size_tracking_batch;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

async fn handle_request(
    event: LambdaEvent<Value>,
    table: &DynamoAggregationTable,
) -> Result<Value, Error> {
    if !is_sqs_event(&event.payload) {
        return Err(Error::from("size tracking expects an SQS event"));
    }
    let bodies = decode_sqs_bodies(&event.payload).map_err(|error| Error::from(error.message))?;

    let summary =
        handle_size_tracking_batch(&bodies, table).map_err(|error| Error::from(error.message))?;
    serde_json::to_value(summary)
        .map_err(|error| Error::from(format!("failed to serialize summary: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = SizeTrackingConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let table = DynamoAggregationTable::new(
        config.table_name,
        DEFAULT_INDEX_NAME,
        aws_sdk_dynamodb::Client::new(&aws_config),
    );

    let table = &table;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, table).await
    }))
    .await
}
