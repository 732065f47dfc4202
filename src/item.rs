//! 아이템(플러그인) 모델 및 탐색
//!
//! 라이브 데이터 폴더의 최상위 디렉터리 하나가 아이템 하나입니다.
//! 플러그인이 자기 폴더 안에 `updater.toml`을 두면 자동 구성(automatic)으로 취급하고,
//! 그렇지 않으면 사용자가 지정한 카탈로그 ID 오버라이드를 사용합니다.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ConfigStore;
use crate::error::UpdaterError;
use crate::layout::InstallLayout;

/// 플러그인이 직접 제공하는 매니페스트 파일 이름
pub const MANIFEST_FILE_NAME: &str = "updater.toml";

/// 관리 대상 플러그인 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// 라이브 트리의 폴더 이름 (안정 식별자)
    pub folder_name: String,
    pub display_name: String,
    /// 원격 카탈로그 ID (없으면 구성되지 않은 아이템)
    pub catalog_id: Option<u32>,
    /// 마지막으로 적용한 버전
    pub last_applied: Option<DateTime<Utc>>,
    /// 플러그인 작성자가 구성했는지 (사용자 오버라이드가 아니라)
    pub automatic: bool,
}

impl Item {
    pub fn is_configured(&self) -> bool {
        self.catalog_id.is_some()
    }
}

/// 원격 메타데이터: 파이프라인은 이 두 필드만 사용
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub download_url: String,
    pub last_updated: DateTime<Utc>,
}

/// 카탈로그 ID → 원격 메타데이터
pub trait MetadataResolver: Send + Sync {
    fn resolve(&self, catalog_id: u32) -> Result<RemoteMetadata, UpdaterError>;
}

/// JSON 인덱스 파일 기반 리졸버
///
/// ```json
/// { "1234": { "download_url": "https://…/Foo.zip", "last_updated": "2016-05-01T00:00:00Z" } }
/// ```
#[derive(Debug, Default, Clone)]
pub struct CatalogFileResolver {
    entries: HashMap<u32, RemoteMetadata>,
}

impl CatalogFileResolver {
    pub fn load(path: &Path) -> Result<Self, UpdaterError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| UpdaterError::from_io(&e, "read catalog", path))?;
        let resolver = Self::from_json(&content)?;
        tracing::info!(
            "[Catalog] Loaded {} entr(ies) from {}",
            resolver.entries.len(),
            path.display()
        );
        Ok(resolver)
    }

    pub fn from_json(content: &str) -> Result<Self, UpdaterError> {
        let raw: HashMap<String, RemoteMetadata> = serde_json::from_str(content)
            .map_err(|e| UpdaterError::protocol(format!("invalid catalog index: {}", e)))?;

        let mut entries = HashMap::with_capacity(raw.len());
        for (key, meta) in raw {
            let id = parse_catalog_id(&key)?;
            entries.insert(id, meta);
        }
        Ok(Self { entries })
    }

    pub fn insert(&mut self, catalog_id: u32, meta: RemoteMetadata) {
        self.entries.insert(catalog_id, meta);
    }
}

impl MetadataResolver for CatalogFileResolver {
    fn resolve(&self, catalog_id: u32) -> Result<RemoteMetadata, UpdaterError> {
        self.entries
            .get(&catalog_id)
            .cloned()
            .ok_or_else(|| UpdaterError::protocol(format!("catalog id {} is not listed", catalog_id)))
    }
}

/// 카탈로그 ID 또는 `?p=<id>` / `&p=<id>`를 포함한 URL
pub fn parse_catalog_id(input: &str) -> Result<u32, UpdaterError> {
    let input = input.trim();
    if let Ok(id) = input.parse::<u32>() {
        return Ok(id);
    }

    let re = Regex::new(r"[?&]p=(\d+)").map_err(|e| UpdaterError::protocol(e.to_string()))?;
    re.captures(input)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(|| UpdaterError::protocol(format!("not a catalog id or catalog URL: {:?}", input)))
}

/// 플러그인 매니페스트
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub catalog_id: Option<u32>,
    pub name: Option<String>,
}

impl PluginManifest {
    pub fn parse(content: &str) -> Option<Self> {
        let val: toml::Value = content.parse().ok()?;
        Some(Self {
            catalog_id: val
                .get("catalog_id")
                .and_then(|v| v.as_integer())
                .and_then(|v| u32::try_from(v).ok()),
            name: val.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()),
        })
    }
}

/// 폴더 자신의 파일을 먼저, 그다음 하위 폴더를 순서대로 탐색해 첫 매니페스트 반환
pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .collect();
    entries.sort();

    if let Some(file) = entries
        .iter()
        .find(|p| p.is_file() && p.file_name().map(|n| n == MANIFEST_FILE_NAME).unwrap_or(false))
    {
        return Some(file.clone());
    }

    entries.iter().filter(|p| p.is_dir()).find_map(|child| find_manifest(child))
}

/// 라이브 데이터 폴더의 플러그인 목록 (폴더 이름 순)
pub fn discover_items(layout: &InstallLayout, store: &dyn ConfigStore) -> Result<Vec<Item>, UpdaterError> {
    let entries = std::fs::read_dir(&layout.data_dir)
        .map_err(|e| UpdaterError::from_io(&e, "scan plugins", &layout.data_dir))?;

    let mut items = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let folder_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        tracing::debug!("[Discovery] Reading {}", folder_name);

        let manifest = find_manifest(&path).and_then(|p| {
            std::fs::read_to_string(&p)
                .ok()
                .and_then(|c| PluginManifest::parse(&c))
                .or_else(|| {
                    tracing::warn!("[Discovery] Ignoring unreadable manifest {}", p.display());
                    None
                })
        });

        let (catalog_id, automatic) = match manifest.as_ref().and_then(|m| m.catalog_id) {
            Some(id) => (Some(id), true),
            None => (store.catalog_override(&folder_name), false),
        };
        let display_name = manifest
            .and_then(|m| m.name)
            .unwrap_or_else(|| folder_name.clone());

        items.push(Item {
            last_applied: catalog_id.and_then(|id| store.last_applied(id)),
            folder_name,
            display_name,
            catalog_id,
            automatic,
        });
    }

    items.sort_by(|a, b| a.folder_name.cmp(&b.folder_name));
    Ok(items)
}
