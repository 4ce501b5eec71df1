use super::{BulkAction, BulkReceipt, BulkSink};
use crate::error::Result;
use async_trait::async_trait;

/// Prints each document as pretty JSON instead of sending it.
#[derive(Debug, Default)]
pub struct PrintSink;

impl PrintSink {
    /// The text printed for one bulk call, one pretty JSON document per action.
    pub fn render(actions: &[BulkAction]) -> Result<String> {
        let mut out = String::new();
        for action in actions {
            out.push_str(&serde_json::to_string_pretty(&action.document)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl BulkSink for PrintSink {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkReceipt> {
        print!("{}", Self::render(actions)?);
        Ok(BulkReceipt {
            items: actions.len(),
            took_ms: None,
        })
    }

    fn describe(&self) -> String {
        "stdout".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalize::{EventLogNormalizer, Normalizer};
    use crate::pipeline::parser::parse_record;
    use serde_json::Value;

    fn action(id: usize) -> BulkAction {
        let record =
            parse_record(&format!("<Event><System><EventID>{id}</EventID></System></Event>")).unwrap();
        BulkAction::new("idx", EventLogNormalizer::default().normalize(record, "App.xml"))
    }

    #[test]
    fn test_render_prints_each_document_in_order() {
        let text = PrintSink::render(&[action(1), action(2)]).unwrap();
        let docs: Vec<Value> = serde_json::Deserializer::from_str(&text)
            .into_iter::<Value>()
            .map(|doc| doc.unwrap())
            .collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["Event"]["System"]["EventID"]["#text"], "1");
        assert_eq!(docs[1]["Event"]["System"]["EventID"]["#text"], "2");
        assert_eq!(docs[1]["file_name"], "App.xml");
        assert!(text.contains("\n  \"Event\""));
    }

    #[tokio::test]
    async fn test_receipt_counts_every_action() {
        let receipt = PrintSink.bulk(&[action(1), action(2), action(3)]).await.unwrap();
        assert_eq!(receipt.items, 3);
        assert_eq!(receipt.took_ms, None);
    }
}
