//! WebDAV 远程存储
//!
//! 所有密文平铺在一个基础目录下，列表使用 `PROPFIND Depth: 1`。

use super::{error_for_status, http_client, RemoteObject, RemoteStore};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// 默认基础目录
pub const DEFAULT_BASE_PATH: &str = "/cryptsync/";

/// 需要特殊基础路径的服务商
struct ProviderQuirk {
    /// 地址中包含该字符串时生效
    marker: &'static str,
    base_path: &'static str,
}

const PROVIDER_QUIRKS: &[ProviderQuirk] = &[ProviderQuirk {
    marker: "webdav.yandex",
    base_path: "disk:/CryptSync/",
}];

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

/// PROPFIND 返回的一项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DavEntry {
    href: String,
    last_modified: i64,
    size: u64,
    is_collection: bool,
}

#[derive(Debug, Clone, Copy)]
enum DavField {
    Href,
    LastModified,
    ContentLength,
}

fn dav_method(name: &'static str) -> SyncResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| SyncError::Configuration(format!("无效的 HTTP 方法 {}: {}", name, e)))
}

/// 解析 HTTP 日期（RFC 1123，部分服务器返回 RFC 3339）
fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.timestamp_millis())
}

/// 解析 207 Multi-Status 响应
fn parse_multistatus(xml: &str) -> SyncResult<Vec<DavEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field: Option<DavField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => field = Some(DavField::Href),
                b"getlastmodified" => field = Some(DavField::LastModified),
                b"getcontentlength" => field = Some(DavField::ContentLength),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| SyncError::Protocol(format!("PROPFIND 响应: {}", e)))?;
                    match f {
                        DavField::Href => entry.href = text.into_owned(),
                        DavField::LastModified => {
                            entry.last_modified = parse_http_date(&text).ok_or_else(|| {
                                warn!("无法解析 getlastmodified: {}", text);
                                SyncError::Protocol(format!("无法解析 getlastmodified: {}", text))
                            })?
                        }
                        DavField::ContentLength => entry.size = text.parse().unwrap_or(0),
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"response" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SyncError::Protocol(format!("PROPFIND 响应: {}", e))),
            _ => {}
        }
    }

    Ok(entries)
}

/// href 的最后一段（已解码）
fn href_file_name(href: &str) -> Option<String> {
    // 去掉 scheme 和 host
    let path = match href.find("://") {
        Some(pos) => {
            let rest = &href[pos + 3..];
            rest.find('/').map_or("", |i| &rest[i..])
        }
        None => href,
    };
    if path.ends_with('/') {
        return None;
    }
    let last = path.rsplit('/').next().filter(|s| !s.is_empty())?;
    urlencoding::decode(last).ok().map(|s| s.into_owned())
}

/// 规范化基础路径：前后各一个 `/`
fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// 确定基础路径：服务商特例优先，其次是配置，最后是默认值
fn resolve_base_path(endpoint: &str, configured: Option<&str>) -> String {
    if let Some(quirk) = PROVIDER_QUIRKS.iter().find(|q| endpoint.contains(q.marker)) {
        return quirk.base_path.to_string();
    }
    configured
        .filter(|p| !p.trim().is_empty())
        .map(normalize_base_path)
        .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string())
}

/// 编码路径的每一段
fn encode_segments(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct WebDavStorage {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: Zeroizing<String>,
    base_path: String,
    collection_url: String,
    base_ready: AtomicBool,
    name: String,
}

impl WebDavStorage {
    pub fn new(
        endpoint: &str,
        username: &str,
        password: &str,
        base_path: Option<String>,
    ) -> SyncResult<Self> {
        let endpoint = if endpoint.ends_with('/') {
            endpoint.to_string()
        } else {
            format!("{}/", endpoint)
        };

        let base_path = resolve_base_path(&endpoint, base_path.as_deref());
        if PROVIDER_QUIRKS.iter().any(|q| endpoint.contains(q.marker)) {
            info!("检测到特殊 WebDAV 服务商，使用基础路径: {}", base_path);
        }

        let collection_url = format!(
            "{}{}",
            endpoint,
            encode_segments(base_path.trim_start_matches('/'))
        );
        let name = format!("webdav://{}", collection_url.trim_end_matches('/'));

        Ok(Self {
            client: http_client()?,
            endpoint,
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            base_path,
            collection_url,
            base_ready: AtomicBool::new(false),
            name,
        })
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn collection_url(&self) -> &str {
        &self.collection_url
    }

    fn object_url(&self, remote_name: &str) -> String {
        format!("{}{}", self.collection_url, urlencoding::encode(remote_name))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(self.password.as_str()))
    }

    async fn propfind(&self, url: &str, depth: &str) -> SyncResult<reqwest::Response> {
        let resp = self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        error_for_status(resp, url).await
    }

    /// 资源是否存在
    pub async fn exists(&self, url: &str) -> SyncResult<bool> {
        match self.propfind(url, "0").await {
            Ok(_) => Ok(true),
            Err(SyncError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_directory(&self, url: &str) -> SyncResult<()> {
        let resp = self.request(dav_method("MKCOL")?, url).send().await?;
        // 405: 目录已存在
        if resp.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        error_for_status(resp, url).await?;
        info!("已创建远程目录: {}", url);
        Ok(())
    }

    /// 确保基础目录存在（每个实例只检查一次）
    async fn ensure_base_dir(&self) -> SyncResult<()> {
        if self.base_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.exists(&self.collection_url).await? {
            self.create_directory(&self.collection_url).await?;
        }
        self.base_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// 连接诊断：依次检查服务器根目录、基础目录，返回可读的结论
    pub async fn diagnose(&self) -> String {
        if let Err(e) = self.exists(&self.endpoint).await {
            return format!("无法连接 WebDAV 根目录: {}，请检查地址和凭证", e);
        }
        match self.exists(&self.collection_url).await {
            Err(e) => format!("已连接服务器，但无法访问 {}: {}", self.base_path, e),
            Ok(true) => "诊断通过".to_string(),
            Ok(false) => match self.create_directory(&self.collection_url).await {
                Ok(()) => "诊断通过（已创建基础目录）".to_string(),
                Err(e) => format!("已连接服务器，但无法创建 {}: {}", self.base_path, e),
            },
        }
    }
}

#[async_trait]
impl RemoteStore for WebDavStorage {
    async fn test_connection(&self) -> bool {
        match self.ensure_base_dir().await {
            Ok(()) => true,
            Err(e) => {
                error!("WebDAV 连接测试失败: {}", e);
                false
            }
        }
    }

    async fn list_files(&self) -> SyncResult<Vec<RemoteObject>> {
        self.ensure_base_dir().await?;

        let body = self
            .propfind(&self.collection_url, "1")
            .await?
            .text()
            .await?;

        let objects: Vec<RemoteObject> = parse_multistatus(&body)?
            .into_iter()
            .filter(|e| !e.is_collection)
            .filter_map(|e| {
                let name = href_file_name(&e.href)?;
                Some(RemoteObject {
                    name,
                    last_modified: e.last_modified,
                    size: e.size,
                })
            })
            .collect();

        debug!("WebDAV 列表: {} 个文件", objects.len());
        Ok(objects)
    }

    async fn upload_file(
        &self,
        local_path: &str,
        ciphertext: Vec<u8>,
        remote_name: &str,
    ) -> SyncResult<()> {
        self.ensure_base_dir().await?;

        let url = self.object_url(remote_name);
        let resp = self
            .request(Method::PUT, &url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(ciphertext)
            .send()
            .await?;
        error_for_status(resp, &url).await?;

        debug!("已上传: {} -> {}", local_path, remote_name);
        Ok(())
    }

    async fn download_file(&self, remote_name: &str) -> SyncResult<Vec<u8>> {
        let url = self.object_url(remote_name);
        let resp = self.request(Method::GET, &url).send().await?;
        let resp = match error_for_status(resp, &url).await {
            Err(SyncError::NotFound(_)) => {
                return Err(SyncError::NotFound(remote_name.to_string()))
            }
            other => other?,
        };
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete_file(&self, remote_name: &str) -> SyncResult<()> {
        let url = self.object_url(remote_name);
        let resp = self.request(Method::DELETE, &url).send().await?;
        match error_for_status(resp, &url).await {
            Ok(_) => {
                debug!("已删除远程文件: {}", remote_name);
                Ok(())
            }
            Err(SyncError::NotFound(_)) => {
                warn!("远程文件不存在，跳过删除: {}", remote_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
