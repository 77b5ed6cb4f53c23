use std::time::Duration;

use bucket_watch_lambda::adapters::object_store::ObjectStore;
use bucket_watch_lambda::adapters::s3::S3ObjectStore;
use bucket_watch_lambda::config::DriverConfig;
use bucket_watch_lambda::handlers::driver::{handle_driver_event, DriverHarness};
use bucket_watch_lambda::handlers::reporting::ApiGatewayResponse;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::{json, Value};

struct AwsDriverHarness {
    store: S3ObjectStore,
    http: reqwest::Client,
    plotting_api_url: String,
}

impl DriverHarness for AwsDriverHarness {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), String> {
        self.store.put_object(key, body, Some("text/plain"))
    }

    fn delete_object(&self, key: &str) -> Result<(), String> {
        self.store.delete_object(key)
    }

    fn wait(&self, seconds: u64) -> Result<(), String> {
        tokio::task::block_in_place(|| std::thread::sleep(Duration::from_secs(seconds)));
        Ok(())
    }

    fn call_report(&self) -> Result<ApiGatewayResponse, String> {
        let client = self.http.clone();
        let url = self.plotting_api_url.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|error| format!("failed to call report endpoint: {error}"))?;
                let status_code = response.status().as_u16();
                let body = response
                    .text()
                    .await
                    .map_err(|error| format!("failed to read report response: {error}"))?;
                Ok(ApiGatewayResponse {
                    status_code,
                    headers: json!({"Content-Type": "application/json"}),
                    body,
                })
            })
        })
    }
}

async fn handle_request(
    event: LambdaEvent<Value>,
    harness: &AwsDriverHarness,
) -> Result<ApiGatewayResponse, Error> {
    Ok(handle_driver_event(&event.payload, harness))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = DriverConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let harness = AwsDriverHarness {
        store: S3ObjectStore::new(config.bucket, aws_sdk_s3::Client::new(&aws_config)),
        http: reqwest::Client::new(),
        plotting_api_url: config.plotting_api_url,
    };

    let harness = &harness;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, harness).await
    }))
    .await
}
