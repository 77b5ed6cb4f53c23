use bucket_watch_lambda::adapters::s3::S3ObjectStore;
use bucket_watch_lambda::config::CleanerConfig;
use bucket_watch_lambda::handlers::cleaner::{handle_cleanup, CleanupResponse};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

async fn handle_request(
    _event: LambdaEvent<Value>,
    config: &CleanerConfig,
    store: &S3ObjectStore,
) -> Result<CleanupResponse, Error> {
    handle_cleanup(store, &config.policy).map_err(|error| Error::from(error.message))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = CleanerConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let store = S3ObjectStore::new(config.bucket.clone(), aws_sdk_s3::Client::new(&aws_config));

    let (config, store) = (&config, &store);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, config, store).await
    }))
    .await
}
