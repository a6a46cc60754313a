//! S3 兼容对象存储
//!
//! 使用 path-style 地址和 SigV4 签名直接发送 HTTP 请求。

use super::retry::RetryPolicy;
use super::sigv4::{canonical_query_string, sha256_hex, uri_encode, SigV4Signer, SignableRequest};
use super::{error_for_status, http_client, RemoteObject, RemoteStore};
use crate::core::cache::ListingCache;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_REGION: &str = "us-east-1";

/// ListObjectsV2 的一页
#[derive(Debug, Default)]
struct ListPage {
    keys: Vec<(String, i64, u64)>,
    is_truncated: bool,
    next_token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum ListField {
    Key,
    LastModified,
    Size,
    IsTruncated,
    NextToken,
}

fn parse_list_objects(xml: &str) -> SyncResult<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut current: Option<(String, i64, u64)> = None;
    let mut field: Option<ListField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Contents" => current = Some((String::new(), 0, 0)),
                b"Key" => field = Some(ListField::Key),
                b"LastModified" => field = Some(ListField::LastModified),
                b"Size" => field = Some(ListField::Size),
                b"IsTruncated" => field = Some(ListField::IsTruncated),
                b"NextContinuationToken" => field = Some(ListField::NextToken),
                _ => field = None,
            },
            Ok(Event::Text(t)) => {
                let Some(f) = field else { continue };
                let text = t
                    .unescape()
                    .map_err(|e| SyncError::Protocol(format!("ListObjectsV2 响应: {}", e)))?;
                match (f, current.as_mut()) {
                    (ListField::Key, Some(obj)) => obj.0 = text.into_owned(),
                    (ListField::LastModified, Some(obj)) => {
                        obj.1 = chrono::DateTime::parse_from_rfc3339(&text)
                            .map(|t| t.timestamp_millis())
                            .map_err(|_| {
                                warn!("无法解析 LastModified: {}", text);
                                SyncError::Protocol(format!("无法解析 LastModified: {}", text))
                            })?
                    }
                    (ListField::Size, Some(obj)) => obj.2 = text.parse().unwrap_or(0),
                    (ListField::IsTruncated, None) => page.is_truncated = text == "true",
                    (ListField::NextToken, None) => page.next_token = Some(text.into_owned()),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Contents" {
                    if let Some(obj) = current.take() {
                        page.keys.push(obj);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SyncError::Protocol(format!("ListObjectsV2 响应: {}", e))),
            _ => {}
        }
    }

    Ok(page)
}

/// 规范化前缀：去掉开头的 `/`，非空时以 `/` 结尾
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

pub struct S3Storage {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    prefix: String,
    signer: SigV4Signer,
    retry: RetryPolicy,
    cache: ListingCache,
    cache_key: String,
    name: String,
}

impl S3Storage {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        prefix: &str,
        listing_ttl: Duration,
    ) -> SyncResult<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(SyncError::Configuration(format!(
                "对象存储地址必须以 http:// 或 https:// 开头: {}",
                endpoint
            )));
        }

        let prefix = normalize_prefix(prefix);
        let cache_key = ListingCache::key(&endpoint, bucket, &prefix);
        let name = format!("s3://{}/{}", bucket, prefix);

        Ok(Self {
            client: http_client()?,
            signer: SigV4Signer::new(access_key, secret_key, region, &endpoint),
            endpoint,
            bucket: bucket.to_string(),
            prefix,
            retry: RetryPolicy::default(),
            cache: ListingCache::new(listing_ttl),
            cache_key,
            name,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_key(&self, remote_name: &str) -> String {
        format!("{}{}", self.prefix, remote_name)
    }

    /// path-style 路径：/bucket 或 /bucket/key
    fn canonical_path(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!(
                "/{}/{}",
                uri_encode(&self.bucket, true),
                uri_encode(key, false)
            ),
            None => format!("/{}", uri_encode(&self.bucket, true)),
        }
    }

    /// 发送一次签名请求
    async fn send_once(
        &self,
        method: &Method,
        key: Option<&str>,
        query: &[(String, String)],
        body: &Bytes,
    ) -> SyncResult<reqwest::Response> {
        let path = self.canonical_path(key);
        let mut url = format!("{}{}", self.endpoint, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query_string(query));
        }
        let url = reqwest::Url::parse(&url)
            .map_err(|e| SyncError::Configuration(format!("无效的对象存储地址 {}: {}", url, e)))?;

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SyncError::Configuration(format!(
                    "对象存储地址缺少主机名: {}",
                    url
                )))
            }
        };

        let now = chrono::Utc::now();
        let payload_hash = sha256_hex(body);
        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            (
                "x-amz-date".to_string(),
                now.format("%Y%m%dT%H%M%SZ").to_string(),
            ),
        ];
        if *method == Method::PUT {
            let md5 = base64::engine::general_purpose::STANDARD.encode(Md5::digest(body));
            headers.push(("content-md5".to_string(), md5));
            headers.push((
                "content-type".to_string(),
                "application/octet-stream".to_string(),
            ));
        }

        let authorization = self.signer.authorization(
            &SignableRequest {
                method: method.as_str(),
                canonical_uri: &path,
                query,
                headers: &headers,
                payload_hash: &payload_hash,
            },
            now,
        );

        let mut request = self.client.request(method.clone(), url.clone());
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request
            .header(AUTHORIZATION, authorization)
            .body(body.clone())
            .send()
            .await?;

        error_for_status(resp, url.path()).await
    }

    /// 发送请求，可重试错误按策略重试
    async fn execute(
        &self,
        operation: &str,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        body: Bytes,
    ) -> SyncResult<reqwest::Response> {
        self.retry
            .run(operation, || self.send_once(&method, key, query, &body))
            .await
    }

    /// 列出前缀下的对象
    ///
    /// `fetch_all` 为 false 时只取第一页。结果会被缓存，部分列表不满足完整列表请求。
    pub async fn list_objects(&self, fetch_all: bool) -> SyncResult<Vec<RemoteObject>> {
        if let Some(cached) = self.cache.get(&self.cache_key, fetch_all) {
            return Ok(cached);
        }

        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        let mut complete = true;
        let mut pages = 0;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), self.prefix.clone()),
            ];
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }

            let body = self
                .execute("ListObjectsV2", Method::GET, None, &query, Bytes::new())
                .await?
                .text()
                .await?;
            let page = parse_list_objects(&body)?;
            pages += 1;

            objects.extend(page.keys.into_iter().filter_map(|(key, last_modified, size)| {
                let name = key.strip_prefix(&self.prefix)?;
                // 跳过目录标记和“子目录”
                if name.is_empty() || name.ends_with('/') {
                    return None;
                }
                Some(RemoteObject {
                    name: name.to_string(),
                    last_modified,
                    size,
                })
            }));

            match (page.is_truncated, page.next_token) {
                (true, Some(next)) if fetch_all => token = Some(next),
                (true, next) => {
                    if fetch_all && next.is_none() {
                        warn!("列表被截断但没有 continuation token，结果不完整");
                    }
                    complete = false;
                    break;
                }
                (false, _) => break,
            }
        }

        debug!("S3 列表: {} 个对象 ({} 页)", objects.len(), pages);
        self.cache.put(&self.cache_key, objects.clone(), complete);
        Ok(objects)
    }

    /// 检查前缀目录标记，不存在时创建
    async fn ensure_marker(&self) -> SyncResult<()> {
        if self.prefix.is_empty() {
            return Ok(());
        }
        match self
            .execute("HeadMarker", Method::HEAD, Some(&self.prefix), &[], Bytes::new())
            .await
        {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound(_)) => {
                self.execute("PutMarker", Method::PUT, Some(&self.prefix), &[], Bytes::new())
                    .await?;
                info!("已创建目录标记: {}", self.prefix);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteStore for S3Storage {
    async fn test_connection(&self) -> bool {
        let result = async {
            self.execute("HeadBucket", Method::HEAD, None, &[], Bytes::new())
                .await?;
            self.ensure_marker().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("S3 连接测试失败: {}", e);
                false
            }
        }
    }

    async fn list_files(&self) -> SyncResult<Vec<RemoteObject>> {
        self.list_objects(true).await
    }

    async fn upload_file(
        &self,
        local_path: &str,
        ciphertext: Vec<u8>,
        remote_name: &str,
    ) -> SyncResult<()> {
        let key = self.object_key(remote_name);
        self.execute(
            "PutObject",
            Method::PUT,
            Some(&key),
            &[],
            Bytes::from(ciphertext),
        )
        .await?;
        self.cache.invalidate(&self.cache_key);

        debug!("已上传: {} -> {}", local_path, key);
        Ok(())
    }

    async fn download_file(&self, remote_name: &str) -> SyncResult<Vec<u8>> {
        let key = self.object_key(remote_name);
        match self
            .execute("GetObject", Method::GET, Some(&key), &[], Bytes::new())
            .await
        {
            Ok(resp) => Ok(resp.bytes().await?.to_vec()),
            Err(SyncError::NotFound(_)) => Err(SyncError::NotFound(remote_name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn delete_file(&self, remote_name: &str) -> SyncResult<()> {
        let key = self.object_key(remote_name);
        let result = self
            .execute("DeleteObject", Method::DELETE, Some(&key), &[], Bytes::new())
            .await;
        self.cache.invalidate(&self.cache_key);

        match result {
            Ok(_) => {
                debug!("已删除远程对象: {}", key);
                Ok(())
            }
            Err(SyncError::NotFound(_)) => {
                warn!("远程对象不存在，跳过删除: {}", key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>vault</Name>
  <Prefix>cryptsync/</Prefix>
  <KeyCount>3</KeyCount>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-2</NextContinuationToken>
  <Contents>
    <Key>cryptsync/</Key>
    <LastModified>2024-01-01T00:00:00.000Z</LastModified>
    <Size>0</Size>
  </Contents>
  <Contents>
    <Key>cryptsync/abc</Key>
    <LastModified>2024-01-02T10:00:00.000Z</LastModified>
    <ETag>"d41d8cd98f00b204e9800998ecf8427e"</ETag>
    <Size>64</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn test_parse_list_objects() {
        let page = parse_list_objects(PAGE).unwrap();
        assert!(page.is_truncated);
        assert_eq!(page.next_token.as_deref(), Some("token-2"));
        assert_eq!(page.keys.len(), 2);
        assert_eq!(
            page.keys[1],
            ("cryptsync/abc".to_string(), 1_704_189_600_000, 64)
        );
    }

    #[test]
    fn test_parse_list_objects_rejects_bad_timestamp() {
        let xml = PAGE.replace("2024-01-02T10:00:00.000Z", "yesterday");
        match parse_list_objects(&xml) {
            Err(SyncError::Protocol(msg)) => assert!(msg.contains("yesterday")),
            other => panic!("应返回 Protocol 错误: {:?}", other.map(|p| p.keys)),
        }
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("cryptsync"), "cryptsync/");
        assert_eq!(normalize_prefix("/a/b/"), "a/b/");
        assert_eq!(normalize_prefix(""), "");
    }

    #[test]
    fn test_rejects_endpoint_without_scheme() {
        let err = S3Storage::new("s3.example.com", "b", "us-east-1", "a", "s", "p", Duration::ZERO)
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_canonical_path() {
        let s3 = S3Storage::new(
            "http://127.0.0.1:9000/",
            "vault",
            "us-east-1",
            "a",
            "s",
            "cryptsync",
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(s3.canonical_path(None), "/vault");
        assert_eq!(
            s3.canonical_path(Some(&s3.object_key("abc"))),
            "/vault/cryptsync/abc"
        );
    }
}
