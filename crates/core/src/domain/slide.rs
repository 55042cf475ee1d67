use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::errors::DomainError;

/// Serialized in lowercase; deserialized case-insensitively, the same way
/// outline entries are read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SlideType {
    Title,
    Bullets,
    Text,
    Table,
    Callout,
}

impl SlideType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Bullets => "bullets",
            Self::Text => "text",
            Self::Table => "table",
            Self::Callout => "callout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "title" => Some(Self::Title),
            "bullets" => Some(Self::Bullets),
            "text" => Some(Self::Text),
            "table" => Some(Self::Table),
            "callout" => Some(Self::Callout),
            _ => None,
        }
    }
}

impl TryFrom<String> for SlideType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| {
            format!("unknown slide type `{value}`; expected title, bullets, text, table, or callout")
        })
    }
}

/// Layout-specific slide payload. Each variant carries only the fields that
/// its layout renders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SlideContent {
    Title {
        heading: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subheading: Option<String>,
    },
    Bullets {
        #[serde(skip_serializing_if = "Option::is_none")]
        heading: Option<String>,
        bullets: Vec<String>,
    },
    Text {
        body: String,
    },
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        footer: Option<Vec<String>>,
    },
    Callout {
        text: String,
    },
}

impl SlideContent {
    pub fn slide_type(&self) -> SlideType {
        match self {
            Self::Title { .. } => SlideType::Title,
            Self::Bullets { .. } => SlideType::Bullets,
            Self::Text { .. } => SlideType::Text,
            Self::Table { .. } => SlideType::Table,
            Self::Callout { .. } => SlideType::Callout,
        }
    }

    /// Decodes a raw JSON payload for the given layout, rejecting fields the
    /// layout does not define.
    pub fn from_value(slide_type: SlideType, value: Value) -> Result<Self, DomainError> {
        let content = match slide_type {
            SlideType::Title => {
                let raw: TitlePayload = decode(slide_type, value)?;
                Self::Title { heading: raw.heading, subheading: raw.subheading }
            }
            SlideType::Bullets => {
                let raw: BulletsPayload = decode(slide_type, value)?;
                Self::Bullets { heading: raw.heading, bullets: raw.bullets }
            }
            SlideType::Text => {
                let raw: TextPayload = decode(slide_type, value)?;
                Self::Text { body: raw.body }
            }
            SlideType::Table => {
                let raw: TablePayload = decode(slide_type, value)?;
                Self::Table { headers: raw.headers, rows: raw.rows, footer: raw.footer }
            }
            SlideType::Callout => {
                let raw: CalloutPayload = decode(slide_type, value)?;
                Self::Callout { text: raw.text }
            }
        };
        content.validate()?;
        Ok(content)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            Self::Title { heading, .. } if heading.trim().is_empty() => {
                Err(DomainError::InvalidSlide("title slide heading is empty".to_string()))
            }
            Self::Bullets { bullets, .. } if bullets.is_empty() => {
                Err(DomainError::InvalidSlide("bullets slide has no bullets".to_string()))
            }
            Self::Text { body } if body.trim().is_empty() => {
                Err(DomainError::InvalidSlide("text slide body is empty".to_string()))
            }
            Self::Callout { text } if text.trim().is_empty() => {
                Err(DomainError::InvalidSlide("callout slide text is empty".to_string()))
            }
            Self::Table { headers, rows, footer } => {
                if headers.is_empty() {
                    return Err(DomainError::InvalidSlide("table slide has no headers".to_string()));
                }
                if let Some((index, row)) =
                    rows.iter().enumerate().find(|(_, row)| row.len() != headers.len())
                {
                    return Err(DomainError::InvalidSlide(format!(
                        "table row {} has {} cells but the header has {}",
                        index + 1,
                        row.len(),
                        headers.len()
                    )));
                }
                if let Some(footer) = footer {
                    if footer.len() != headers.len() {
                        return Err(DomainError::InvalidSlide(format!(
                            "table footer has {} cells but the header has {}",
                            footer.len(),
                            headers.len()
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn decode<T: DeserializeOwned>(slide_type: SlideType, value: Value) -> Result<T, DomainError> {
    serde_json::from_value(value).map_err(|error| {
        DomainError::InvalidSlide(format!(
            "content does not match the `{}` layout: {error}",
            slide_type.as_str()
        ))
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TitlePayload {
    heading: String,
    #[serde(default)]
    subheading: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BulletsPayload {
    #[serde(default)]
    heading: Option<String>,
    bullets: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TextPayload {
    body: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TablePayload {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    #[serde(default)]
    footer: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CalloutPayload {
    text: String,
}

/// Slide as produced by a model or read back from storage, before the
/// layout payload has been checked.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlideDraft {
    #[serde(default)]
    pub slide_number: Option<u32>,
    #[serde(rename = "type")]
    pub slide_type: SlideType,
    #[serde(default)]
    pub title: String,
    pub content: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SlideDraft")]
pub struct Slide {
    pub slide_number: u32,
    pub title: String,
    pub content: SlideContent,
}

impl Slide {
    pub fn new(slide_number: u32, title: impl Into<String>, content: SlideContent) -> Self {
        Self { slide_number, title: title.into(), content }
    }

    pub fn slide_type(&self) -> SlideType {
        self.content.slide_type()
    }

    pub fn from_draft(slide_number: u32, draft: SlideDraft) -> Result<Self, DomainError> {
        let content = SlideContent::from_value(draft.slide_type, draft.content)?;
        Ok(Self { slide_number, title: draft.title, content })
    }
}

impl TryFrom<SlideDraft> for Slide {
    type Error = DomainError;

    fn try_from(draft: SlideDraft) -> Result<Self, Self::Error> {
        let slide_number = draft.slide_number.ok_or_else(|| {
            DomainError::InvalidSlide("stored slide is missing slideNumber".to_string())
        })?;
        Self::from_draft(slide_number, draft)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlideRepr<'a> {
    slide_number: u32,
    #[serde(rename = "type")]
    slide_type: SlideType,
    title: &'a str,
    content: &'a SlideContent,
}

impl Serialize for Slide {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SlideRepr {
            slide_number: self.slide_number,
            slide_type: self.slide_type(),
            title: &self.title,
            content: &self.content,
        }
        .serialize(serializer)
    }
}

/// Checks that slide numbers run 1..=n without gaps and every payload is valid.
pub fn validate_deck(slides: &[Slide]) -> Result<(), DomainError> {
    for (index, slide) in slides.iter().enumerate() {
        let expected = index as u32 + 1;
        if slide.slide_number != expected {
            return Err(DomainError::InvalidSlide(format!(
                "slide numbers must be contiguous from 1: expected {expected}, found {}",
                slide.slide_number
            )));
        }
        slide.content.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::errors::DomainError;

    use super::{validate_deck, Slide, SlideContent, SlideDraft, SlideType};

    #[test]
    fn table_rows_must_match_header_width() {
        let error = SlideContent::from_value(
            SlideType::Table,
            json!({
                "headers": ["Plan", "Seats", "Price"],
                "rows": [["Pro", "50"]],
            }),
        )
        .expect_err("short row rejected");

        assert!(matches!(error, DomainError::InvalidSlide(ref message) if message.contains("row 1")));
    }

    #[test]
    fn content_rejects_fields_from_other_layouts() {
        let error = SlideContent::from_value(
            SlideType::Callout,
            json!({ "text": "Save 20%", "bullets": ["extra"] }),
        )
        .expect_err("unknown field rejected");

        assert!(matches!(error, DomainError::InvalidSlide(_)));
    }

    #[test]
    fn serialized_slide_carries_type_next_to_content() {
        let slide = Slide::new(
            2,
            "Pricing",
            SlideContent::Table {
                headers: vec!["Plan".to_string(), "Total".to_string()],
                rows: vec![vec!["Pro".to_string(), "$60,000".to_string()]],
                footer: None,
            },
        );

        let value = serde_json::to_value(&slide).expect("serialize slide");
        assert_eq!(value["slideNumber"], 2);
        assert_eq!(value["type"], "table");
        assert_eq!(value["content"]["headers"][1], "Total");
        assert!(value["content"].get("footer").is_none());

        let decoded: Slide = serde_json::from_value(value).expect("decode stored slide");
        assert_eq!(decoded, slide);
    }

    #[test]
    fn draft_without_number_is_numbered_by_caller() {
        let draft: SlideDraft = serde_json::from_value(json!({
            "type": "bullets",
            "title": "Why Acme",
            "content": { "bullets": ["Fast onboarding", "SOC 2"] },
        }))
        .expect("decode draft");

        let slide = Slide::from_draft(3, draft).expect("valid draft");
        assert_eq!(slide.slide_number, 3);
        assert_eq!(slide.slide_type(), SlideType::Bullets);
    }

    #[test]
    fn slide_type_is_read_case_insensitively() {
        let draft: SlideDraft = serde_json::from_value(json!({
            "type": "Title",
            "title": "Acme Proposal",
            "content": { "heading": "Acme Corp", "subheading": "50 seats, annual" },
        }))
        .expect("decode capitalized type");
        assert_eq!(draft.slide_type, SlideType::Title);

        let slide = Slide::from_draft(1, draft).expect("valid draft");
        assert_eq!(serde_json::to_value(&slide).expect("serialize")["type"], "title");

        let stored: Slide = serde_json::from_value(json!({
            "slideNumber": 2,
            "type": " BULLETS ",
            "title": "Why Acme",
            "content": { "bullets": ["Fast onboarding"] },
        }))
        .expect("decode upper-case stored slide");
        assert_eq!(stored.slide_type(), SlideType::Bullets);

        let unknown = serde_json::from_value::<SlideDraft>(json!({
            "type": "chart",
            "content": {},
        }))
        .expect_err("unknown type rejected");
        assert!(unknown.to_string().contains("unknown slide type `chart`"));
    }

    #[test]
    fn deck_numbers_must_be_contiguous() {
        let callout = |number| {
            Slide::new(number, "Next steps", SlideContent::Callout { text: "Sign by Friday".into() })
        };

        assert!(validate_deck(&[callout(1), callout(2)]).is_ok());
        assert!(validate_deck(&[callout(1), callout(3)]).is_err());
        assert!(validate_deck(&[callout(2)]).is_err());
    }
}
