//! Rule-table text analysis: pulls typed facts out of free text and classifies
//! the user's conversational signals. Every table is an ordered list of
//! `(pattern, classification)` pairs evaluated top to bottom.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::workflow::{DataField, ExtractedData, FieldValue};

#[derive(Debug, Clone, Copy)]
enum Capture {
    /// First capture group is an amount, optional second group a k/m suffix.
    Amount,
    /// First capture group is kept as text.
    Text,
    /// The whole match is kept as text.
    Keyword,
    /// Presence alone sets the field.
    Flag,
}

struct FieldRule {
    field: DataField,
    capture: Capture,
    pattern: Regex,
}

fn rule(field: DataField, capture: Capture, pattern: &str) -> FieldRule {
    FieldRule {
        field,
        capture,
        pattern: Regex::new(pattern).unwrap(),
    }
}

const AMOUNT: &str = r"\$?\s?(\d[\d,]*(?:\.\d+)?)\s*(k|m|mm|million|thousand)?\b";

static USER_RULES: Lazy<Vec<FieldRule>> = Lazy::new(|| {
    use Capture::*;
    use DataField::*;
    vec![
        rule(Ltv, Amount, &format!(r"(?i)\b(?:ltv|lifetime value|clv)\b[^$\d]{{0,30}}{AMOUNT}")),
        rule(
            Cac,
            Amount,
            &format!(r"(?i)\b(?:cac|customer acquisition cost|target cpa|cpa target|cost per acquisition)\b[^$\d]{{0,30}}{AMOUNT}"),
        ),
        rule(Margin, Amount, r"(?i)\bmargins?\b[^\d]{0,20}(\d+(?:\.\d+)?)\s*%"),
        rule(Margin, Amount, r"(?i)(\d+(?:\.\d+)?)\s*%\s*(?:gross\s+|net\s+)?margins?\b"),
        rule(Budget, Amount, &format!(r"(?i)\bbudget\b[^$\d]{{0,30}}{AMOUNT}")),
        rule(
            Budget,
            Amount,
            &format!(r"(?i){AMOUNT}\s*(?:total\s+)?(?:budget|to spend|in (?:media|ad) spend)"),
        ),
        rule(
            Budget,
            Amount,
            r"(?i)\b(?:spend|invest)(?:ing)?\b[^$\d]{0,15}\$\s?(\d[\d,]*(?:\.\d+)?)\s*(k|m|mm|million|thousand)?\b",
        ),
        rule(
            VolumeTarget,
            Amount,
            r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(k)?\s+(?:new\s+|more\s+|qualified\s+)?(?:leads|customers|conversions|sales|sign-?ups|installs|orders|subscribers|bookings|units)\b",
        ),
        rule(
            VolumeTarget,
            Amount,
            r"(?i)\b(?:volume target|target volume|goal)\b[^\d]{0,20}(\d[\d,]*(?:\.\d+)?)\s*(k)?\b",
        ),
        rule(
            Kpi,
            Keyword,
            r"(?i)\b(?:cpa|cpl|roas|cpm|ctr|cost per (?:lead|acquisition|install|sale)|return on ad spend|conversion rate)\b",
        ),
        rule(Kpi, Text, r"(?i)\bkpi\s+(?:is|will be|should be|:)\s*([^.,;!?\n]{2,60})"),
        rule(
            Objective,
            Keyword,
            r"(?i)\b(?:lead generation|generate leads|customer acquisition|acquire (?:new )?customers|brand awareness|awareness|drive sales|grow (?:our |my )?(?:sales|revenue|customer base)|app installs|retention|product launch|launch)\b",
        ),
        rule(
            Objective,
            Text,
            r"(?i)\b(?:objective|goal|aim)\s+(?:is|:)\s+(?:to\s+)?([^.;!?\n]{3,80})",
        ),
        rule(
            Audience,
            Text,
            r"(?i)\b(?:target audience|our audience|audience)\s+(?:is|are|:)\s+([^.;!?\n]{3,80})",
        ),
        rule(Audience, Text, r"(?i)\b(?:targeting|we target|trying to reach)\s+([^.;!?\n]{3,80})"),
        rule(
            Geography,
            Keyword,
            r"(?i)\b(?:nationwide|national(?:ly)?|united states|north america|canada|europe|emea|apac|latam|uk|united kingdom|global(?:ly)?|west coast|east coast|midwest)\b",
        ),
        rule(Geography, Keyword, r"\b(?:US|USA|U\.S\.)\b"),
        rule(
            Timeline,
            Keyword,
            r"(?i)\b(?:q[1-4]|\d+\s*(?:weeks?|months?)|january|february|march|april|may|june|july|august|september|october|november|december|next quarter|this quarter|holiday season|back to school)\b",
        ),
        rule(
            Channels,
            Keyword,
            r"(?i)\b(?:google ads|paid search|search ads|paid social|meta|facebook|instagram|tiktok|linkedin|youtube|ctv|connected tv|display|programmatic|podcasts?|email|influencers?)\b",
        ),
        rule(
            CreativeFormats,
            Keyword,
            r"(?i)\b(?:video|static (?:images?|ads?)|carousel|banners?|ugc|short-form|creative assets?|existing creative)\b",
        ),
        rule(
            Measurement,
            Keyword,
            r"(?i)\b(?:attribution|ga4|google analytics|pixel|conversion tracking|mmm|media mix model|lift tests?|utm|crm tracking)\b",
        ),
        rule(
            Approval,
            Flag,
            r"(?i)\b(?:looks good|approved?|sign(?:ed)? off|let'?s (?:go|proceed|do it)|go ahead|finali[sz]e it|ship it)\b",
        ),
    ]
});

static AGENT_RULES: Lazy<Vec<FieldRule>> = Lazy::new(|| {
    vec![rule(
        DataField::Forecast,
        Capture::Flag,
        r"(?i)\b(?:forecast|projected|projection|we (?:expect|estimate)|expected to (?:generate|deliver|drive))\b[^.\n]*\d",
    )]
});

/// Facts revealed by a user message. The first matching rule for a field wins.
pub fn extract_user_data(text: &str) -> ExtractedData {
    apply_rules(&USER_RULES, text)
}

/// Facts an agent message establishes on its own (a presented forecast).
pub fn extract_agent_data(text: &str) -> ExtractedData {
    apply_rules(&AGENT_RULES, text)
}

fn apply_rules(rules: &[FieldRule], text: &str) -> ExtractedData {
    let mut data = ExtractedData::new();
    for rule in rules {
        if data.contains_key(&rule.field) {
            continue;
        }
        let Some(caps) = rule.pattern.captures(text) else {
            continue;
        };
        let value = match rule.capture {
            Capture::Amount => caps.get(1).and_then(|amount| {
                parse_amount(amount.as_str(), caps.get(2).map(|suffix| suffix.as_str()))
                    .map(FieldValue::Number)
            }),
            Capture::Text => caps
                .get(1)
                .map(|m| FieldValue::Text(m.as_str().trim().to_string())),
            Capture::Keyword => caps
                .get(0)
                .map(|m| FieldValue::Text(m.as_str().trim().to_lowercase())),
            Capture::Flag => Some(FieldValue::Flag(true)),
        };
        if let Some(value) = value {
            data.insert(rule.field, value);
        }
    }
    data
}

/// Parses `750,000`, `750k`, `1.5 million` and friends.
pub fn parse_amount(digits: &str, suffix: Option<&str>) -> Option<f64> {
    let base: f64 = digits.replace(',', "").parse().ok()?;
    let multiplier = match suffix.map(str::to_ascii_lowercase).as_deref() {
        Some("k") | Some("thousand") => 1_000.0,
        Some("m") | Some("mm") | Some("million") => 1_000_000.0,
        _ => 1.0,
    };
    Some(base * multiplier)
}

/// Conversational signals the user simulator exposes alongside its message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSignals {
    pub said_i_dont_know: bool,
    pub tried_to_skip: bool,
    pub pushed_back: bool,
}

static RE_IDK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:i (?:don'?t|do not) know|not sure|no idea|i'?m unsure|unsure|i don'?t have (?:that|those|the)|haven'?t (?:calculated|measured|tracked)|no clue)\b",
    )
    .unwrap()
});

static RE_SKIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:skip (?:this|that|ahead)|let'?s move on|can we (?:just )?(?:skip|jump|move on)|just give me (?:the|a) plan|jump (?:ahead|straight))\b",
    )
    .unwrap()
});

static RE_PUSHBACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:i disagree|that doesn'?t (?:seem|sound) right|that'?s too (?:high|low|expensive|much)|why do you need|i don'?t think so|that won'?t work|not convinced)\b",
    )
    .unwrap()
});

pub fn classify_user_signals(text: &str) -> UserSignals {
    UserSignals {
        said_i_dont_know: RE_IDK.is_match(text),
        tried_to_skip: RE_SKIP.is_match(text),
        pushed_back: RE_PUSHBACK.is_match(text),
    }
}

pub fn signals_uncertainty(text: &str) -> bool {
    RE_IDK.is_match(text)
}

/// Sentences of `text` that end in a question mark, in order.
pub fn questions(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        match ch {
            '?' => {
                let question = current.trim();
                if question.len() > 1 {
                    out.push(question.to_string());
                }
                current.clear();
            }
            '.' | '!' | '\n' => current.clear(),
            _ => {}
        }
    }
    out
}

/// Lower-cases, drops punctuation other than apostrophes and collapses whitespace.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c == '$' || c == '%' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_budget_and_volume_from_a_single_message() {
        let data = extract_user_data(
            "We have a budget of $750,000 and want 5,000 new customers this year.",
        );
        assert_eq!(data.get(&DataField::Budget), Some(&FieldValue::Number(750_000.0)));
        assert_eq!(data.get(&DataField::VolumeTarget), Some(&FieldValue::Number(5_000.0)));
    }

    #[test]
    fn understands_suffixes() {
        assert_eq!(parse_amount("750", Some("k")), Some(750_000.0));
        assert_eq!(parse_amount("1.5", Some("million")), Some(1_500_000.0));
        assert_eq!(parse_amount("12,500", None), Some(12_500.0));
        let data = extract_user_data("Our LTV is about $1.2k and margin is 40%.");
        assert_eq!(data.get(&DataField::Ltv), Some(&FieldValue::Number(1_200.0)));
        assert_eq!(data.get(&DataField::Margin), Some(&FieldValue::Number(40.0)));
    }

    #[test]
    fn outcomes_step_fields() {
        let data = extract_user_data(
            "Our goal is lead generation for the new product. KPI is cost per lead and we need 2,000 leads.",
        );
        assert!(data.contains_key(&DataField::Objective));
        assert_eq!(data.get(&DataField::Kpi), Some(&FieldValue::Text("cost per lead".into())));
        assert_eq!(data.get(&DataField::VolumeTarget), Some(&FieldValue::Number(2_000.0)));
    }

    #[test]
    fn lowercase_us_is_not_a_geography() {
        let data = extract_user_data("Can you help us figure this out?");
        assert!(!data.contains_key(&DataField::Geography));
        let data = extract_user_data("We only sell in the US.");
        assert!(data.contains_key(&DataField::Geography));
    }

    #[test]
    fn agent_forecast_detection() {
        assert!(extract_agent_data("At that spend we expect roughly 4,800 customers.")
            .contains_key(&DataField::Forecast));
        assert!(extract_agent_data("What is your budget?").is_empty());
    }

    #[test]
    fn user_signals() {
        let signals = classify_user_signals("Honestly I don't know our CAC.");
        assert!(signals.said_i_dont_know);
        assert!(!signals.pushed_back);
        assert!(classify_user_signals("Can we skip this and just give me a plan?").tried_to_skip);
        assert!(classify_user_signals("That's too expensive for us.").pushed_back);
    }

    #[test]
    fn splits_questions() {
        let qs = questions("Great start. What is your budget? And who is your audience? Thanks!");
        assert_eq!(qs, vec!["What is your budget?", "And who is your audience?"]);
        assert_eq!(normalize("What's  your BUDGET?"), "what's your budget");
    }
}
