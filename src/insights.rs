use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::features::{
    FeatureMap, PUBLISHER_BIN_LARGE, PUBLISHER_BIN_MAJOR, PUBLISHER_BIN_MEDIUM,
    PUBLISHER_BIN_SMALL, feature_f64,
};
use crate::llm::TextGenerator;
use crate::news::{NewsArticle, NewsSource, is_relevant_article};
use crate::predictor::DecisionRecord;

pub const DEFAULT_RECENCY_YEAR: i32 = 2024;

const NEWS_LIMIT: usize = 3;
const PROMPT_FACTOR_LIMIT: usize = 4;
const PROMPT_HEADLINE_LIMIT: usize = 3;
const BULLET_COUNT: usize = 3;
const BULLET_MAX_WORDS: usize = 25;
const BULLET_MAX_TOKENS: u32 = 220;
const SUMMARY_MAX_TOKENS: u32 = 90;

const SALE_WINDOW_FLAGS: [&str; 4] = [
    "is_summer_sale_window",
    "is_autumn_sale_window",
    "is_holiday_season",
    "within_7d_of_steam_sale",
];

const PUBLISHER_NOTES: [(&str, &str); 4] = [
    (
        PUBLISHER_BIN_MAJOR,
        "Backed by a major publisher; they rarely discount at launch but usually join seasonal sales.",
    ),
    (
        PUBLISHER_BIN_LARGE,
        "Large publisher; modest discounts within the first months are possible.",
    ),
    (
        PUBLISHER_BIN_MEDIUM,
        "Mid-sized publisher; launch promotions are sometimes used.",
    ),
    (
        PUBLISHER_BIN_SMALL,
        "Smaller publisher; pricing tends to be more flexible, including early discounts.",
    ),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rationale {
    pub sale_confidence_comment: String,
    pub contextual_factors: Vec<String>,
    pub news: Vec<NewsArticle>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulletSource {
    Generated,
    // generated, topped up from the templates
    Mixed,
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedRationale {
    pub appid: u64,
    pub name: Option<String>,
    pub confidence_30d: String,
    pub confidence_60d: String,
    pub contextual_factors: Vec<String>,
    pub news: Vec<NewsArticle>,
    pub bullets: [String; BULLET_COUNT],
    pub bullet_source: BulletSource,
}

/// News and text generation are optional; a disabled or failing collaborator
/// contributes nothing.
#[derive(Clone)]
pub struct InsightService {
    news: Option<Arc<dyn NewsSource>>,
    generator: Option<Arc<dyn TextGenerator>>,
    recency_year_cutoff: i32,
}

impl Default for InsightService {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_YEAR)
    }
}

impl InsightService {
    pub fn new(recency_year_cutoff: i32) -> Self {
        Self {
            news: None,
            generator: None,
            recency_year_cutoff,
        }
    }

    pub fn with_news(mut self, news: Arc<dyn NewsSource>) -> Self {
        self.news = Some(news);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn news_enabled(&self) -> bool {
        self.news.as_ref().is_some_and(|n| n.is_enabled())
    }

    pub fn generator_enabled(&self) -> bool {
        self.generator.as_ref().is_some_and(|g| g.is_enabled())
    }

    pub fn explain(
        &self,
        appid: u64,
        decision: &DecisionRecord,
        features: &FeatureMap,
        game_name: Option<&str>,
    ) -> Rationale {
        let contextual_factors = self.contextual_factors(features);
        let news = self.fetch_news(appid, game_name);
        let summary = self.generate_summary(appid, decision, &contextual_factors, &news, game_name);
        Rationale {
            sale_confidence_comment: confidence_comment(decision),
            contextual_factors,
            news,
            summary,
        }
    }

    pub fn explain_combined(
        &self,
        appid: u64,
        name: Option<&str>,
        decision30: &DecisionRecord,
        decision60: &DecisionRecord,
        features: &FeatureMap,
    ) -> CombinedRationale {
        let contextual_factors = self.contextual_factors(features);
        let news = self.fetch_news(appid, name);
        let generated = self.generate_bullets(
            appid,
            name,
            decision30,
            decision60,
            &contextual_factors,
            &news,
        );
        let (bullets, bullet_source) = complete_bullets(generated, decision30, decision60);

        CombinedRationale {
            appid,
            name: name.map(str::to_string),
            confidence_30d: confidence_comment(decision30),
            confidence_60d: confidence_comment(decision60),
            contextual_factors,
            news,
            bullets,
            bullet_source,
        }
    }

    // Each rule adds at most one entry and is skipped on missing or non-numeric input.
    pub fn contextual_factors(&self, features: &FeatureMap) -> Vec<String> {
        let mut factors = Vec::new();

        if let Some(year) = feature_f64(features, "release_year")
            && year >= f64::from(self.recency_year_cutoff)
        {
            factors.push(
                "Looks like a new or upcoming title; deep discounts right after launch are less common."
                    .to_string(),
            );
        }

        if let Some((_, note)) = PUBLISHER_NOTES
            .iter()
            .find(|(bin, _)| flag_set(features, bin))
        {
            factors.push((*note).to_string());
        }

        if flag_set(features, "early_access") {
            factors.push("Early access title; pricing is still experimental.".to_string());
        }

        if feature_f64(features, "franchise_count_prev").is_some_and(|n| n >= 3.0) {
            factors.push(
                "Part of an active franchise; bundles and franchise-wide promotions are more common."
                    .to_string(),
            );
        }

        if SALE_WINDOW_FLAGS.iter().any(|flag| flag_set(features, flag)) {
            factors.push("Release timing falls near a major Steam sale window.".to_string());
        }

        factors
    }

    fn fetch_news(&self, appid: u64, game_name: Option<&str>) -> Vec<NewsArticle> {
        let Some(name) = game_name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Vec::new();
        };
        let Some(source) = self.news.as_ref().filter(|n| n.is_enabled()) else {
            return Vec::new();
        };
        match source.search(name, NEWS_LIMIT) {
            Ok(articles) => articles
                .into_iter()
                .filter(|a| is_relevant_article(&a.title, Some(name)))
                .take(NEWS_LIMIT)
                .collect(),
            Err(err) => {
                tracing::warn!(appid, error = %format!("{err:#}"), "news_fetch_failed");
                Vec::new()
            }
        }
    }

    fn generate_bullets(
        &self,
        appid: u64,
        name: Option<&str>,
        decision30: &DecisionRecord,
        decision60: &DecisionRecord,
        factors: &[String],
        news: &[NewsArticle],
    ) -> Vec<String> {
        let Some(generator) = self.generator.as_ref().filter(|g| g.is_enabled()) else {
            return Vec::new();
        };
        let prompt = build_bullet_prompt(
            appid,
            name,
            decision30.score(),
            decision60.score(),
            factors,
            news,
        );
        match generator.generate(&prompt, BULLET_MAX_TOKENS) {
            Ok(text) => parse_bullets(&text),
            Err(err) => {
                tracing::warn!(appid, error = %format!("{err:#}"), "insight_bullets_failed");
                Vec::new()
            }
        }
    }

    fn generate_summary(
        &self,
        appid: u64,
        decision: &DecisionRecord,
        factors: &[String],
        news: &[NewsArticle],
        game_name: Option<&str>,
    ) -> Option<String> {
        let generator = self.generator.as_ref().filter(|g| g.is_enabled())?;
        let prompt = build_summary_prompt(appid, decision, factors, news, game_name);
        match generator.generate(&prompt, SUMMARY_MAX_TOKENS) {
            Ok(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            Err(err) => {
                tracing::warn!(appid, error = %format!("{err:#}"), "insight_summary_failed");
                None
            }
        }
    }
}

fn flag_set(features: &FeatureMap, key: &str) -> bool {
    feature_f64(features, key).is_some_and(|v| v > 0.0)
}

pub fn confidence_comment(decision: &DecisionRecord) -> String {
    let horizon = decision.horizon();
    let score = decision.score();
    if score >= 0.85 {
        format!("Very strong chance of a discount within the next {horizon}.")
    } else if score >= 0.65 {
        format!("Good chance of a discount within the next {horizon}.")
    } else if score >= 0.45 {
        if decision.will_discount() {
            format!("Borderline case, but slightly in favor of a discount within {horizon}.")
        } else {
            format!("Borderline probability; a discount within {horizon} is possible but uncertain.")
        }
    } else {
        format!("Unlikely to see a discount within the next {horizon} based on current signals.")
    }
}

fn display_name(appid: u64, name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => n.to_string(),
        None => format!("Steam app {appid}"),
    }
}

pub fn build_bullet_prompt(
    appid: u64,
    name: Option<&str>,
    score30: f64,
    score60: f64,
    factors: &[String],
    news: &[NewsArticle],
) -> String {
    let mut prompt = format!(
        "Game: {}\nModel estimate of a discount within 30 days: {:.0}%\nModel estimate of a discount within 60 days: {:.0}%\n",
        display_name(appid, name),
        score30 * 100.0,
        score60 * 100.0,
    );
    push_context(&mut prompt, factors, news);
    prompt.push_str(&format!(
        "\nWrite exactly {BULLET_COUNT} short bullet points for a price-sensitive buyer deciding whether to wait for a discount. \
         One bullet per line, each at most {BULLET_MAX_WORDS} words. \
         These are estimates: do not guarantee any outcome or promise a sale will happen.\n"
    ));
    prompt
}

fn build_summary_prompt(
    appid: u64,
    decision: &DecisionRecord,
    factors: &[String],
    news: &[NewsArticle],
    name: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Game: {}\nModel estimate of a discount within the next {}: {:.0}%\n",
        display_name(appid, name),
        decision.horizon(),
        decision.score() * 100.0,
    );
    push_context(&mut prompt, factors, news);
    prompt.push_str(&format!(
        "\nSummarize the discount outlook in one sentence of at most {BULLET_MAX_WORDS} words. \
         Do not guarantee any outcome.\n"
    ));
    prompt
}

fn push_context(prompt: &mut String, factors: &[String], news: &[NewsArticle]) {
    if !factors.is_empty() {
        prompt.push_str("Context:\n");
        for f in factors.iter().take(PROMPT_FACTOR_LIMIT) {
            prompt.push_str(&format!("- {f}\n"));
        }
    }
    if !news.is_empty() {
        prompt.push_str("Recent headlines:\n");
        for a in news.iter().take(PROMPT_HEADLINE_LIMIT) {
            prompt.push_str(&format!("- {}\n", a.title));
        }
    }
}

/// Up to three non-empty lines with list markers (`-`, `*`, `•`, `1.`, `1)`)
/// and markdown bold stripped.
pub fn parse_bullets(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_marker)
        .filter(|line| !line.is_empty())
        .take(BULLET_COUNT)
        .collect()
}

// A marker only counts when whitespace follows it, so "1.5x" survives.
fn strip_marker(line: &str) -> String {
    let mut line = line.trim();
    for marker in ['-', '*', '•'] {
        if let Some(rest) = line.strip_prefix(marker)
            && rest.starts_with(char::is_whitespace)
        {
            line = rest;
            break;
        }
    }
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0
        && let Some(rest) = line[digits..].strip_prefix(['.', ')'])
        && rest.starts_with(char::is_whitespace)
    {
        line = rest;
    }
    line.trim().replace("**", "")
}

pub fn fallback_bullets(decision30: &DecisionRecord, decision60: &DecisionRecord) -> [String; 3] {
    let p30 = decision30.score() * 100.0;
    let first = if p30 < 20.0 {
        format!("30-day outlook: low chance of a discount ({p30:.0}%).")
    } else if p30 > 60.0 {
        format!("30-day outlook: strong chance of a discount ({p30:.0}%).")
    } else {
        format!("30-day outlook: some chance of a discount ({p30:.0}%), but not a high-confidence call.")
    };

    let p60 = decision60.score() * 100.0;
    let second = if p60 < 30.0 {
        format!("60-day outlook: a discount looks unlikely even over 60 days ({p60:.0}%).")
    } else if p60 > 60.0 {
        format!("60-day outlook: a discount within 60 days is quite plausible ({p60:.0}%).")
    } else {
        format!("60-day outlook: the odds improve somewhat over 60 days ({p60:.0}%) but remain uncertain.")
    };

    let third = if decision30.will_discount() || decision60.will_discount() {
        "If you are price-sensitive, it is reasonable to hold off and watch for a discount."
    } else {
        "If you want it now, buying near launch is reasonable; an early discount looks unlikely."
    };

    [first, second, third.to_string()]
}

pub fn released_rationale(appid: u64, name: Option<&str>) -> CombinedRationale {
    let note = "No launch-window forecast: this title has already released.".to_string();
    CombinedRationale {
        appid,
        name: name.map(str::to_string),
        confidence_30d: note.clone(),
        confidence_60d: note,
        contextual_factors: Vec::new(),
        news: Vec::new(),
        bullets: [
            "This game has already released.".to_string(),
            "Forecasts cover upcoming titles and launch-window discounts.".to_string(),
            "Check current store prices directly for real-time deals.".to_string(),
        ],
        bullet_source: BulletSource::Template,
    }
}

fn complete_bullets(
    generated: Vec<String>,
    decision30: &DecisionRecord,
    decision60: &DecisionRecord,
) -> ([String; 3], BulletSource) {
    let template = fallback_bullets(decision30, decision60);
    let source = match generated.len() {
        0 => return (template, BulletSource::Template),
        n if n >= BULLET_COUNT => BulletSource::Generated,
        _ => BulletSource::Mixed,
    };
    let mut bullets = template;
    for (slot, text) in bullets.iter_mut().zip(generated) {
        *slot = text;
    }
    (bullets, source)
}
