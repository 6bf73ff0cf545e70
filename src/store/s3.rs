use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::ObjectMetadata;
use crate::store::{CompletedPart, CompletedUpload, ListPage, ListRequest, ObjectStore};
use crate::Etag;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::ops::Range;
use tracing::instrument;

pub const REGION: &str = "region";
pub const PROFILE: &str = "profile";
pub const ACCESS_KEY: &str = "access_key";
pub const SECRET_KEY: &str = "secret_key";
pub const SESSION_TOKEN: &str = "session_token";
/// Custom endpoint for S3 compatible services, implies path style addressing
pub const ENDPOINT: &str = "endpoint";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_PROFILE: &str = "default";

/// [`ObjectStore`] backed by the AWS S3 API.
#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from `config`.
    ///
    /// Static credentials are used when `access_key` is present, otherwise the
    /// named shared profile (`default` if unset) is loaded.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let region = config.get(REGION).unwrap_or(DEFAULT_REGION).to_string();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));

        loader = match config.get(ACCESS_KEY) {
            Some(access_key) => {
                let secret_key = config
                    .get(SECRET_KEY)
                    .ok_or_else(|| Error::Config(format!("{} requires {}", ACCESS_KEY, SECRET_KEY)))?;
                loader.credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    config.get(SESSION_TOKEN).map(|s| s.to_string()),
                    None,
                    "rfs",
                ))
            }
            None => loader.profile_name(config.get(PROFILE).unwrap_or(DEFAULT_PROFILE)),
        };

        if let Some(endpoint) = config.get(ENDPOINT) {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.contains_key(ENDPOINT))
            .build();

        Ok(Self::new(Client::from_conf(s3_config)))
    }
}

fn to_utc(dt: Option<&AwsDateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_default()
}

fn size(len: Option<i64>) -> u64 {
    len.unwrap_or(0).max(0) as u64
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_not_found() => Error::NotFound(format!("s3://{}/{}", bucket, key)),
                _ => Error::transport(err),
            })?;

        Ok(ObjectMetadata::new(
            key,
            size(resp.content_length()),
            resp.e_tag().map(Etag::from),
            to_utc(resp.last_modified()),
        ))
    }

    #[instrument(skip(self))]
    async fn get_range(&self, bucket: &str, key: &str, range: Range<u64>) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            // http ranges are inclusive on both ends
            .range(format!("bytes={}-{}", range.start, range.end.saturating_sub(1)))
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_no_such_key() => {
                    Error::NotFound(format!("s3://{}/{}", bucket, key))
                }
                _ => Error::transport(err),
            })?;

        let data = resp.body.collect().await.map_err(Error::transport)?;
        Ok(data.into_bytes())
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, request: &ListRequest) -> Result<ListPage> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(request.prefix.as_str())
            .set_delimiter(request.delimiter.clone())
            .set_start_after(request.start_after.clone())
            .set_continuation_token(request.continuation.clone())
            .set_max_keys(request.max_keys.map(|n| n.min(i32::MAX as usize) as i32))
            .send()
            .await
            .map_err(Error::transport)?;

        let objects = resp
            .contents()
            .iter()
            .filter_map(|o| {
                o.key().map(|key| {
                    ObjectMetadata::new(
                        key,
                        size(o.size()),
                        o.e_tag().map(Etag::from),
                        to_utc(o.last_modified()),
                    )
                })
            })
            .collect();

        let prefixes = resp
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(|p| p.to_string()))
            .collect();

        let next = match resp.is_truncated() {
            Some(true) => resp.next_continuation_token().map(|s| s.to_string()),
            _ => None,
        };

        Ok(ListPage {
            objects,
            prefixes,
            next,
        })
    }

    #[instrument(skip(self))]
    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(Error::transport)?;

        resp.upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::transport("upload id missing from response"))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<Etag> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| Error::transport(format!("part number {} out of range", part_number)))?;
        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(Error::transport)?;

        resp.e_tag()
            .map(Etag::from)
            .ok_or_else(|| Error::transport("etag missing from upload part response"))
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload> {
        let parts = parts
            .iter()
            .map(|p| {
                AwsCompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(p.etag.as_str())
                    .build()
            })
            .collect::<Vec<_>>();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(Error::transport)?;

        Ok(CompletedUpload {
            bucket: resp.bucket().unwrap_or(bucket).to_string(),
            key: resp.key().unwrap_or(key).to_string(),
            etag: resp
                .e_tag()
                .map(Etag::from)
                .ok_or_else(|| Error::transport("etag missing from completion response"))?,
        })
    }

    #[instrument(skip(self))]
    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(Error::transport)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(Error::transport)?;
        Ok(())
    }
}
