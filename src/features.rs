use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::ShopCatalog;

// Kept as JSON so client-supplied maps can be checked for non-numeric values.
pub type FeatureMap = Map<String, Value>;

pub const DEFAULT_LAUNCH_PRICE: f64 = 60.0;
pub const MAX_LAUNCH_PRICE: f64 = 100_000.0;
pub const DEFAULT_FRANCHISE_COUNT: i64 = 1;

pub const PUBLISHER_BIN_SMALL: &str = "publisher_size_bin__Small (≤5)";
pub const PUBLISHER_BIN_MEDIUM: &str = "publisher_size_bin__Medium (6–15)";
pub const PUBLISHER_BIN_LARGE: &str = "publisher_size_bin__Large (16–50)";
pub const PUBLISHER_BIN_MAJOR: &str = "publisher_size_bin__Major (>50)";

pub const DEVELOPER_BIN_SOLO: &str = "developer_size_bin__Solo/Indie (≤2)";
pub const DEVELOPER_BIN_SMALL: &str = "developer_size_bin__Small (3–5)";
pub const DEVELOPER_BIN_MID: &str = "developer_size_bin__Mid (6–15)";
pub const DEVELOPER_BIN_LARGE: &str = "developer_size_bin__Large (>15)";

// Training order of the bundled models.
pub const FEATURE_NAMES: [&str; 36] = [
    "log_launch_price",
    "publisher_size_log",
    "release_year",
    "release_quarter",
    "release_month",
    "release_weekday",
    "is_holiday_season",
    "is_summer_sale_window",
    "early_access",
    "mature",
    "Achievements",
    "is_multiplatform_refined",
    "exclusive_steam",
    "is_multi_store_pc",
    "is_cross_platform",
    "genre_cluster_strategy_sim",
    "genre_cluster_mmo",
    "genre_cluster_story_action",
    "genre_cluster_sports_competitive",
    "is_autumn_sale_window",
    "within_7d_of_steam_sale",
    "franchise_count_prev",
    "developer_size_log",
    PUBLISHER_BIN_SMALL,
    PUBLISHER_BIN_MEDIUM,
    PUBLISHER_BIN_LARGE,
    PUBLISHER_BIN_MAJOR,
    DEVELOPER_BIN_SOLO,
    DEVELOPER_BIN_SMALL,
    DEVELOPER_BIN_MID,
    DEVELOPER_BIN_LARGE,
    "price_x_multiplatform",
    "publisher_x_multiplatform",
    "developer_x_multiplatform",
    "price_x_pubsize",
    "price_x_devsize",
];

const PRICE_KEYS: &[&str] = &["price", "price_usd", "launch_price", "current_price"];
const RELEASE_DATE_KEYS: &[&str] = &["release_date", "releaseDate", "released", "date"];
const PLATFORM_KEYS: &[&str] = &["platforms"];
const STORE_KEYS: &[&str] = &["shops", "stores", "other_pc_stores"];
const TAG_KEYS: &[&str] = &["tags", "genres"];
const CATALOG_ID_KEYS: &[&str] = &["itad_id", "id"];
const PC_PLATFORMS: &[&str] = &["pc", "windows", "mac", "macos", "linux", "steamos"];

#[derive(Debug, Clone, Copy)]
pub struct GenreCluster {
    pub feature: &'static str,
    pub keywords: &'static [&'static str],
}

// Order matters: the franchise estimate takes the first active cluster with a median.
pub const GENRE_CLUSTERS: [GenreCluster; 4] = [
    GenreCluster {
        feature: "genre_cluster_strategy_sim",
        keywords: &[
            "strategy",
            "simulation",
            "simulator",
            "4x",
            "city builder",
            "management",
            "tactic",
            "rts",
            "turn-based",
            "tycoon",
            "colony sim",
        ],
    },
    GenreCluster {
        feature: "genre_cluster_mmo",
        keywords: &["mmo", "massively multiplayer"],
    },
    GenreCluster {
        feature: "genre_cluster_story_action",
        keywords: &[
            "action",
            "adventure",
            "story rich",
            "rpg",
            "open world",
            "shooter",
            "narrative",
            "souls-like",
            "hack and slash",
        ],
    },
    GenreCluster {
        feature: "genre_cluster_sports_competitive",
        keywords: &[
            "sports",
            "racing",
            "fighting",
            "competitive",
            "esports",
            "football",
            "soccer",
            "basketball",
            "pvp",
            "battle royale",
        ],
    },
];

/// Publisher and developer size are both estimated from launch price by
/// [`estimate_org_size`] until real catalogue data exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrgSize {
    Small,
    Medium,
    Large,
    Major,
}

impl OrgSize {
    pub fn size_log(self) -> f64 {
        match self {
            OrgSize::Small => 1.2,
            OrgSize::Medium => 2.0,
            OrgSize::Large => 2.7,
            OrgSize::Major => 3.4,
        }
    }

    pub fn publisher_bin(self) -> &'static str {
        match self {
            OrgSize::Small => PUBLISHER_BIN_SMALL,
            OrgSize::Medium => PUBLISHER_BIN_MEDIUM,
            OrgSize::Large => PUBLISHER_BIN_LARGE,
            OrgSize::Major => PUBLISHER_BIN_MAJOR,
        }
    }

    pub fn developer_bin(self) -> &'static str {
        match self {
            OrgSize::Small => DEVELOPER_BIN_SOLO,
            OrgSize::Medium => DEVELOPER_BIN_SMALL,
            OrgSize::Large => DEVELOPER_BIN_MID,
            OrgSize::Major => DEVELOPER_BIN_LARGE,
        }
    }
}

pub fn estimate_org_size(price: f64) -> OrgSize {
    if price < 15.0 {
        OrgSize::Small
    } else if price < 30.0 {
        OrgSize::Medium
    } else if price < 50.0 {
        OrgSize::Large
    } else {
        OrgSize::Major
    }
}

// near_sale approximates the big Steam sales by month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleCalendar {
    pub holiday: Vec<u32>,
    pub summer: Vec<u32>,
    pub autumn: Vec<u32>,
    pub near_sale: Vec<u32>,
}

impl Default for SaleCalendar {
    fn default() -> Self {
        Self {
            holiday: vec![11, 12],
            summer: vec![6, 7],
            autumn: vec![10],
            near_sale: vec![6, 11, 12],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePolicy {
    pub primary: String,
    pub recognized: Vec<String>,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            primary: "Steam".to_string(),
            recognized: [
                "Steam",
                "GOG",
                "Epic Game Store",
                "Humble Store",
                "Microsoft Store",
                "Ubisoft Store",
                "EA App",
                "GreenManGaming",
                "Fanatical",
                "GamersGate",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl StorePolicy {
    pub fn recognized_among(&self, listed: &[String]) -> Vec<String> {
        let listed_norm = listed.iter().map(|s| normalize_store(s)).collect::<Vec<_>>();
        self.recognized
            .iter()
            .filter(|store| listed_norm.contains(&normalize_store(store)))
            .cloned()
            .collect()
    }

    pub fn is_primary(&self, store: &str) -> bool {
        normalize_store(store) == normalize_store(&self.primary)
    }
}

fn normalize_store(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct FranchiseTable {
    medians: HashMap<String, f64>,
}

impl FranchiseTable {
    // Missing or unreadable files yield an empty table.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "franchise_medians_unavailable");
                return Self::default();
            }
        };
        match serde_json::from_str::<HashMap<String, f64>>(&raw) {
            Ok(medians) => Self::from_medians(medians),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "franchise_medians_unparseable");
                Self::default()
            }
        }
    }

    pub fn from_medians(medians: HashMap<String, f64>) -> Self {
        let medians = medians
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| {
                let key = k.strip_suffix("_y").unwrap_or(&k).to_string();
                (key, v)
            })
            .collect();
        Self { medians }
    }

    pub fn median(&self, cluster_feature: &str) -> Option<f64> {
        self.medians.get(cluster_feature).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.medians.is_empty()
    }
}

pub struct FeatureBuilder {
    franchise: FranchiseTable,
    calendar: SaleCalendar,
    stores: StorePolicy,
    expected: Vec<String>,
    catalog: Option<Arc<dyn ShopCatalog>>,
}

impl FeatureBuilder {
    pub fn new(franchise: FranchiseTable) -> Self {
        Self {
            franchise,
            calendar: SaleCalendar::default(),
            stores: StorePolicy::default(),
            expected: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            catalog: None,
        }
    }

    pub fn from_path(franchise_path: &Path) -> Self {
        Self::new(FranchiseTable::load(franchise_path))
    }

    pub fn with_calendar(mut self, calendar: SaleCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_store_policy(mut self, stores: StorePolicy) -> Self {
        self.stores = stores;
        self
    }

    pub fn with_expected_keys(mut self, expected: Vec<String>) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ShopCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(&self, appid: u64, game: &Value) -> FeatureMap {
        self.build_at(appid, game, Utc::now().date_naive())
    }

    pub fn build_at(&self, appid: u64, game: &Value, today: NaiveDate) -> FeatureMap {
        let mut f = FeatureMap::new();

        let price = extract_launch_price(game)
            .filter(|p| *p > 0.0)
            .map(|p| p.min(MAX_LAUNCH_PRICE))
            .unwrap_or(DEFAULT_LAUNCH_PRICE);
        put_f64(&mut f, "log_launch_price", price.ln());

        let release = extract_release_date(game).unwrap_or_else(|| default_release_date(today));
        let month = release.month();
        put_int(&mut f, "release_year", release.year() as i64);
        put_int(&mut f, "release_month", month as i64);
        put_int(&mut f, "release_quarter", ((month - 1) / 3 + 1) as i64);
        put_int(
            &mut f,
            "release_weekday",
            release.weekday().num_days_from_monday() as i64,
        );

        put_flag(&mut f, "is_holiday_season", self.calendar.holiday.contains(&month));
        put_flag(&mut f, "is_summer_sale_window", self.calendar.summer.contains(&month));
        put_flag(&mut f, "is_autumn_sale_window", self.calendar.autumn.contains(&month));
        put_flag(&mut f, "within_7d_of_steam_sale", self.calendar.near_sale.contains(&month));

        put_flag(
            &mut f,
            "early_access",
            pick_bool(game, &["early_access", "earlyAccess"]).unwrap_or(false),
        );
        put_flag(&mut f, "mature", pick_bool(game, &["mature"]).unwrap_or(false));
        put_flag(
            &mut f,
            "Achievements",
            pick_bool(game, &["achievements"]).unwrap_or(true),
        );

        let platform = self.platform_flags(appid, game);
        put_flag(&mut f, "is_multiplatform_refined", platform.multiplatform);
        put_flag(&mut f, "exclusive_steam", platform.exclusive);
        put_flag(&mut f, "is_multi_store_pc", platform.multi_store);
        put_flag(&mut f, "is_cross_platform", platform.cross_platform);

        let publisher = estimate_org_size(price);
        let developer = estimate_org_size(price);
        put_f64(&mut f, "publisher_size_log", publisher.size_log());
        put_f64(&mut f, "developer_size_log", developer.size_log());
        for tier in [OrgSize::Small, OrgSize::Medium, OrgSize::Large, OrgSize::Major] {
            put_flag(&mut f, tier.publisher_bin(), tier == publisher);
            put_flag(&mut f, tier.developer_bin(), tier == developer);
        }

        let tags = string_list(game, TAG_KEYS);
        let clusters = map_tags_to_genre_clusters(&tags);
        for (cluster, active) in GENRE_CLUSTERS.iter().zip(clusters.iter()) {
            put_flag(&mut f, cluster.feature, *active);
        }

        let franchise = GENRE_CLUSTERS
            .iter()
            .zip(clusters.iter())
            .filter(|(_, active)| **active)
            .find_map(|(cluster, _)| self.franchise.median(cluster.feature))
            .map(|median| median.round() as i64)
            .unwrap_or(DEFAULT_FRANCHISE_COUNT);
        put_int(&mut f, "franchise_count_prev", franchise);

        let multiplatform = if platform.multiplatform { 1.0 } else { 0.0 };
        put_f64(&mut f, "price_x_multiplatform", price * multiplatform);
        put_f64(
            &mut f,
            "publisher_x_multiplatform",
            publisher.size_log() * multiplatform,
        );
        put_f64(
            &mut f,
            "developer_x_multiplatform",
            developer.size_log() * multiplatform,
        );
        put_f64(&mut f, "price_x_pubsize", price * publisher.size_log());
        put_f64(&mut f, "price_x_devsize", price * developer.size_log());

        let missing = self
            .expected
            .iter()
            .filter(|k| f.get(k.as_str()).and_then(coerce_numeric).is_none())
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            tracing::warn!(appid, missing = ?missing, "feature_builder_missing_keys");
        }

        f
    }

    fn platform_flags(&self, appid: u64, game: &Value) -> PlatformFlags {
        let platforms = string_list(game, PLATFORM_KEYS)
            .into_iter()
            .map(|p| p.to_ascii_lowercase())
            .collect::<Vec<_>>();
        let mut distinct = platforms.clone();
        distinct.sort();
        distinct.dedup();

        let non_pc = distinct
            .iter()
            .any(|p| !PC_PLATFORMS.contains(&p.as_str()));

        let listed = self
            .listed_storefronts(appid, game)
            .unwrap_or_else(|| string_list(game, STORE_KEYS));
        let recognized = self.stores.recognized_among(&listed);
        let multi_store = recognized.len() > 1;
        let exclusive = recognized.len() == 1 && self.stores.is_primary(&recognized[0]);

        PlatformFlags {
            multiplatform: non_pc || multi_store,
            exclusive,
            multi_store,
            cross_platform: distinct.len() > 1,
        }
    }

    fn listed_storefronts(&self, appid: u64, game: &Value) -> Option<Vec<String>> {
        let catalog = self.catalog.as_ref().filter(|c| c.is_enabled())?;
        let id = pick_string(game, CATALOG_ID_KEYS)?;
        match catalog.storefronts(&id) {
            Ok(shops) => Some(shops),
            Err(err) => {
                tracing::warn!(appid, catalog_id = %id, error = %format!("{err:#}"), "shop_lookup_failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PlatformFlags {
    multiplatform: bool,
    exclusive: bool,
    multi_store: bool,
    cross_platform: bool,
}

pub fn map_tags_to_genre_clusters(tags: &[String]) -> [bool; 4] {
    let lowered = tags.iter().map(|t| t.to_lowercase()).collect::<Vec<_>>();
    let mut out = [false; 4];
    for (idx, cluster) in GENRE_CLUSTERS.iter().enumerate() {
        out[idx] = lowered
            .iter()
            .any(|tag| cluster.keywords.iter().any(|kw| tag.contains(kw)));
    }
    out
}

/// Numbers, booleans and numeric strings. Null and non-finite values are `None`.
pub fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

pub fn feature_f64(features: &FeatureMap, key: &str) -> Option<f64> {
    features.get(key).and_then(coerce_numeric)
}

fn default_release_date(today: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(today.year(), 12, 1).unwrap_or(today)
}

pub fn extract_launch_price(game: &Value) -> Option<f64> {
    for key in PRICE_KEYS {
        let Some(v) = game.get(*key) else { continue };
        if let Some(price) = price_from_value(v) {
            return Some(price);
        }
    }
    None
}

// "$19.99", "1,299"
pub fn parse_price_text(raw: &str) -> Option<f64> {
    price_from_value(&Value::String(raw.to_string()))
}

fn price_from_value(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches(['$', '£', '€'])
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        Value::Object(map) => map.get("amount").and_then(price_from_value),
        _ => None,
    };
    price.filter(|p| p.is_finite())
}

pub fn extract_release_date(game: &Value) -> Option<NaiveDate> {
    let raw = RELEASE_DATE_KEYS
        .iter()
        .filter_map(|k| game.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    let prefix = raw.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

fn pick_bool(game: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        let Some(v) = game.get(*key) else { continue };
        match v {
            Value::Bool(b) => return Some(*b),
            Value::Number(n) => return Some(n.as_f64().is_some_and(|x| x != 0.0)),
            Value::String(s) => {
                let s = s.trim().to_ascii_lowercase();
                return Some(matches!(s.as_str(), "true" | "yes" | "1"));
            }
            Value::Null => continue,
            _ => return Some(false),
        }
    }
    None
}

fn pick_string(game: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match game.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn string_list(game: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        let Some(Value::Array(items)) = game.get(*key) else {
            continue;
        };
        let out = items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(map) => map
                    .get("name")
                    .or_else(|| map.get("title"))
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if !out.is_empty() {
            return out;
        }
    }
    Vec::new()
}

// Non-finite values would serialize as null.
fn put_f64(f: &mut FeatureMap, key: &str, value: f64) {
    let value = if value.is_finite() { value } else { 0.0 };
    f.insert(key.to_string(), Value::from(value));
}

fn put_int(f: &mut FeatureMap, key: &str, value: i64) {
    f.insert(key.to_string(), Value::from(value));
}

fn put_flag(f: &mut FeatureMap, key: &str, on: bool) {
    put_int(f, key, i64::from(on));
}
