//! Selector logic over HTML snapshots of the crash page.
//!
//! Selectors are a versioned contract with the third-party page: change
//! them together with the fixtures in the tests below.

use crate::types::{CatchError, CatchResult, CrashResult};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

/// The live results-history container.
pub const BANNER_SELECTOR: &str = "#crash-banner";
/// One result entry inside the banner, oldest first.
pub const ITEM_SELECTOR: &str = "div.flex.items-center.justify-center.gap-1.px-2.h-full.cursor-pointer";
/// Round id inside an entry.
pub const GAME_ID_SELECTOR: &str = "span.text-tertiary.font-semibold";
/// Multiplier inside an entry.
pub const MULTIPLIER_SELECTOR: &str = "span.font-extrabold";

const BALANCE_SELECTOR: &str = "div.flex.w-0.flex-auto.items-center.truncate.font-extrabold";
const COIN_IMAGE_SELECTOR: &str = r#"img[src*="USDT"], img[src*="coin"]"#;
const COIN_CONTAINER_SELECTOR: &str = "div.flex.items-center";
const BOLD_DIV_SELECTOR: &str = "div.font-extrabold";

struct Selectors {
    banner: Selector,
    item: Selector,
    game_id: Selector,
    multiplier: Selector,
    balance: Selector,
    coin_image: Selector,
    coin_container: Selector,
    bold_div: Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: OnceLock<Selectors> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        let parse = |s: &str| Selector::parse(s).expect("static selector is valid");
        Selectors {
            banner: parse(BANNER_SELECTOR),
            item: parse(ITEM_SELECTOR),
            game_id: parse(GAME_ID_SELECTOR),
            multiplier: parse(MULTIPLIER_SELECTOR),
            balance: parse(BALANCE_SELECTOR),
            coin_image: parse(COIN_IMAGE_SELECTOR),
            coin_container: parse(COIN_CONTAINER_SELECTOR),
            bold_div: parse(BOLD_DIV_SELECTOR),
        }
    })
}

/// One entry as found in the DOM, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub game_id: Option<String>,
    pub multiplier: Option<String>,
    pub raw: String,
}

impl RawItem {
    fn into_result(self) -> Option<CrashResult> {
        CrashResult::new(self.game_id?, self.multiplier?, self.raw)
    }
}

/// Items of the banner in document order; `None` if the banner is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannerSnapshot {
    pub items: Option<Vec<RawItem>>,
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn nested_text(el: ElementRef<'_>, selector: &Selector) -> Option<String> {
    el.select(selector)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

/// Parse an HTML document or fragment that should contain the banner.
pub fn parse_banner(html: &str) -> BannerSnapshot {
    let sel = selectors();
    let doc = Html::parse_fragment(html);
    let Some(banner) = doc.select(&sel.banner).next() else {
        return BannerSnapshot { items: None };
    };

    let items = banner
        .select(&sel.item)
        .map(|item| RawItem {
            game_id: nested_text(item, &sel.game_id),
            multiplier: nested_text(item, &sel.multiplier),
            raw: text_of(item),
        })
        .collect();

    BannerSnapshot { items: Some(items) }
}

impl BannerSnapshot {
    /// The most recent result: the last item in document order.
    ///
    /// Strict: a malformed last item is an error, not a reason to look
    /// further back.
    pub fn latest(self) -> CatchResult<CrashResult> {
        let items = self.items.ok_or(CatchError::MissingContainer)?;
        let last = items.into_iter().last().ok_or(CatchError::NoResultItems)?;
        if last.game_id.is_none() {
            return Err(CatchError::MissingField("game id"));
        }
        if last.multiplier.is_none() {
            return Err(CatchError::MissingField("multiplier"));
        }
        last.into_result().ok_or(CatchError::MissingField("game id"))
    }

    /// Every well-formed result in document order; malformed items are skipped.
    pub fn all(self) -> Vec<CrashResult> {
        self.items
            .unwrap_or_default()
            .into_iter()
            .filter_map(RawItem::into_result)
            .collect()
    }
}

fn plain_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\d,]+\.?\d*$").expect("static regex is valid"))
}

fn money_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$?[\d,]+\.?\d*$").expect("static regex is valid"))
}

/// Strip `$`/`,` and parse the leading decimal number, like JS `parseFloat`.
pub fn parse_amount(text: &str) -> Option<f64> {
    static LEADING: OnceLock<Regex> = OnceLock::new();
    let leading = LEADING.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").expect("static regex is valid")
    });
    let cleaned: String = text.chars().filter(|c| *c != '$' && *c != ',').collect();
    let cleaned = cleaned.trim();
    leading
        .find(cleaned)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Account balance from a full page, trying each strategy in order:
/// the dedicated balance div, the amount next to a coin icon, then any
/// bold div that reads as a plain amount.
pub fn parse_balance(html: &str) -> Option<f64> {
    let sel = selectors();
    let doc = Html::parse_document(html);

    if let Some(el) = doc.select(&sel.balance).next() {
        if let Some(v) = parse_amount(&text_of(el)) {
            return Some(v);
        }
    }

    for img in doc.select(&sel.coin_image) {
        let container = img
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|a| sel.coin_container.matches(a));
        let Some(container) = container else { continue };
        let Some(bold) = container.select(&sel.bold_div).next() else {
            continue;
        };
        let text = text_of(bold);
        if text.contains('$') || plain_number().is_match(&text) {
            if let Some(v) = parse_amount(&text) {
                return Some(v);
            }
        }
    }

    doc.select(&sel.bold_div)
        .map(text_of)
        .filter(|t| money_number().is_match(t))
        .find_map(|t| parse_amount(&t))
}
