use prechat_core::domain::{IntentSource, PurchaseIntent};
use tracing::debug;

const BUYER_KEYWORDS: &[&str] = &[
    "preço",
    "valor",
    "quanto custa",
    "comprar",
    "compra",
    "pagamento",
    "pagar",
    "desconto",
    "promoção",
    "oferta",
    "orçamento",
    "quero comprar",
    "quanto é",
    "valor do",
    "custa quanto",
    "forma de pagamento",
];

const INTERESTED_KEYWORDS: &[&str] = &[
    "como funciona",
    "funciona",
    "benefícios",
    "vantagens",
    "inclui",
    "garantia",
    "suporte",
    "detalhes",
    "mais informações",
    "explicar",
    "entender",
    "saber mais",
    "informações sobre",
    "como é",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub intent: PurchaseIntent,
    pub source: IntentSource,
    pub matched_keyword: Option<String>,
}

/// Local, zero-cost purchase-intent classifier. Buyer keywords win over interested
/// ones; anything else is curious.
#[derive(Clone, Debug)]
pub struct KeywordClassifier {
    buyer: Vec<String>,
    interested: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::with_keywords(
            BUYER_KEYWORDS.iter().map(|keyword| keyword.to_string()).collect(),
            INTERESTED_KEYWORDS.iter().map(|keyword| keyword.to_string()).collect(),
        )
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords(buyer: Vec<String>, interested: Vec<String>) -> Self {
        let prepare = |keywords: Vec<String>| {
            keywords
                .into_iter()
                .map(|keyword| normalize_text(&keyword))
                .filter(|keyword| !keyword.is_empty())
                .collect::<Vec<_>>()
        };
        Self { buyer: prepare(buyer), interested: prepare(interested) }
    }

    /// A menu pick ("1".."3") is authoritative; free text falls back to keywords.
    pub fn classify(&self, text: &str, menu_choice: Option<&str>) -> Classification {
        if let Some(intent) = menu_choice.and_then(PurchaseIntent::from_menu_choice) {
            return Classification { intent, source: IntentSource::Menu, matched_keyword: None };
        }
        self.classify_text(text)
    }

    pub fn classify_text(&self, text: &str) -> Classification {
        let normalized = normalize_text(text);

        let (intent, matched_keyword) = if let Some(keyword) = first_match(&normalized, &self.buyer) {
            (PurchaseIntent::Buyer, Some(keyword))
        } else if let Some(keyword) = first_match(&normalized, &self.interested) {
            (PurchaseIntent::Interested, Some(keyword))
        } else {
            (PurchaseIntent::Curious, None)
        };

        debug!(
            event_name = "agent.intent.classified",
            intent = intent.as_str(),
            keyword = matched_keyword.as_deref().unwrap_or(""),
            "local intent classification"
        );

        Classification { intent, source: IntentSource::Classifier, matched_keyword }
    }
}

fn first_match(normalized: &str, keywords: &[String]) -> Option<String> {
    keywords.iter().find(|keyword| normalized.contains(keyword.as_str())).cloned()
}

/// Lowercases, folds Portuguese diacritics and collapses whitespace so
/// "Preço", "preco" and "PREÇO  " all compare equal.
fn normalize_text(text: &str) -> String {
    let folded: String = text.to_lowercase().chars().map(fold_diacritic).collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_diacritic(character: char) -> char {
    match character {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        other => other,
    }
}
