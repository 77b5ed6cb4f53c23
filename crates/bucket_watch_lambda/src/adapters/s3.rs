use aws_sdk_s3::primitives::ByteStream;
use bucket_watch_core::contract::StoredObject;

use super::block_on;
use super::object_store::ObjectStore;

pub struct S3ObjectStore {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(bucket: impl Into<String>, client: aws_sdk_s3::Client) -> Self {
        Self {
            bucket: bucket.into(),
            client,
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(
        &self,
        key: &str,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), String> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(body.to_vec()));

        block_on(async move {
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|error| format!("failed to write object to s3: {error}"))
        })
    }

    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let request = self.client.get_object().bucket(&self.bucket).key(key);

        block_on(async move {
            let output = match request.send().await {
                Ok(output) => output,
                Err(error) => {
                    let missing = error
                        .as_service_error()
                        .map(|service_error| service_error.is_no_such_key())
                        .unwrap_or(false);
                    if missing {
                        return Ok(None);
                    }
                    return Err(format!("failed to read object from s3: {error}"));
                }
            };
            let data = output
                .body
                .collect()
                .await
                .map_err(|error| format!("failed to read s3 object body: {error}"))?;
            Ok(Some(data.into_bytes().to_vec()))
        })
    }

    fn delete_object(&self, key: &str) -> Result<(), String> {
        // S3 answers 204 for keys that do not exist.
        let request = self.client.delete_object().bucket(&self.bucket).key(key);

        block_on(async move {
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|error| format!("failed to delete object from s3: {error}"))
        })
    }

    fn list_objects(&self) -> Result<Vec<StoredObject>, String> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();

        block_on(async move {
            let mut objects = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let page = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .set_continuation_token(continuation_token.take())
                    .send()
                    .await
                    .map_err(|error| format!("failed to list s3 objects: {error}"))?;

                for object in page.contents() {
                    let Some(key) = object.key() else {
                        continue;
                    };
                    objects.push(StoredObject {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }

                match page.next_continuation_token() {
                    Some(token) if page.is_truncated().unwrap_or(false) => {
                        continuation_token = Some(token.to_string());
                    }
                    _ => break,
                }
            }
            Ok(objects)
        })
    }
}
