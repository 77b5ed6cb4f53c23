use bucket_watch_lambda::adapters::dynamodb::DynamoAggregationTable;
use bucket_watch_lambda::adapters::s3::S3ObjectStore;
use bucket_watch_lambda::config::ReportingConfig;
use bucket_watch_lambda::handlers::reporting::{handle_report_request, ApiGatewayResponse};
use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

struct RuntimeDependencies {
    config: ReportingConfig,
    table: DynamoAggregationTable,
    store: S3ObjectStore,
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &RuntimeDependencies,
) -> Result<ApiGatewayResponse, Error> {
    Ok(handle_report_request(
        &event.payload,
        &deps.config,
        Utc::now().timestamp_millis(),
        &deps.table,
        &deps.store,
    ))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = ReportingConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let deps = RuntimeDependencies {
        table: DynamoAggregationTable::new(
            config.table_name.clone(),
            config.index_name.clone(),
            aws_sdk_dynamodb::Client::new(&aws_config),
        ),
        store: S3ObjectStore::new(config.bucket.clone(), aws_sdk_s3::Client::new(&aws_config)),
        config,
    };

    let deps = &deps;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, deps).await
    }))
    .await
}
