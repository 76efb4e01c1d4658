//! Invoice data schema and validation.
//!
//! The extraction service returns free-form JSON; this module checks it
//! actually looks like an invoice before it is handed back to the caller.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub description: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvoiceData {
    pub invoice_number: Option<String>,
    pub date: Option<String>,
    pub vendor_name: Option<String>,
    pub total_amount: Option<f64>,
    /// `None` means the key was absent entirely; an invoice without a
    /// `line_items` key fails validation, an empty list passes.
    pub line_items: Option<Vec<LineItem>>,
}

/// Tolerance for quantity * unit_price vs. total_price comparisons.
const PRICE_EPSILON: f64 = 0.01;

impl InvoiceData {
    /// Parse the structured payload the service produced. Models sometimes
    /// wrap JSON in markdown code fences; those are stripped first.
    pub fn from_json_text(text: &str) -> Result<InvoiceData, serde_json::Error> {
        serde_json::from_str(strip_code_fences(text))
    }

    /// Check the extraction is complete and internally consistent. Returns
    /// human-readable feedback on the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        let mut missing = Vec::new();
        if self.invoice_number.as_deref().is_none_or_empty() {
            missing.push("invoice_number");
        }
        if self.date.as_deref().is_none_or_empty() {
            missing.push("date");
        }
        if self.vendor_name.as_deref().is_none_or_empty() {
            missing.push("vendor_name");
        }
        if self.total_amount.is_none() {
            missing.push("total_amount");
        }
        if self.line_items.is_none() {
            missing.push("line_items");
        }
        if !missing.is_empty() {
            return Err(format!("missing required fields: {}", missing.join(", ")));
        }

        let date = self.date.as_deref().unwrap_or_default();
        if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(format!(
                "invalid date format, expected YYYY-MM-DD, got {date}"
            ));
        }

        let total = self.total_amount.unwrap_or_default();
        if total <= 0.0 {
            return Err("total amount must be greater than 0".to_string());
        }

        for (i, item) in self.line_items.iter().flatten().enumerate() {
            let n = i + 1;
            let (Some(quantity), Some(unit_price), Some(total_price)) =
                (item.quantity, item.unit_price, item.total_price)
            else {
                return Err(format!("line item {n} is missing numeric fields"));
            };
            if item.description.as_deref().is_none_or_empty() {
                return Err(format!("line item {n} is missing a description"));
            }
            if quantity <= 0.0 || unit_price < 0.0 || total_price < 0.0 {
                return Err(format!("line item {n} has invalid numeric values"));
            }
            let calculated = (quantity * unit_price * 100.0).round() / 100.0;
            if (calculated - total_price).abs() > PRICE_EPSILON {
                return Err(format!(
                    "line item {n}: quantity * unit_price ({calculated}) does not match total_price ({total_price})"
                ));
            }
        }

        Ok(())
    }
}

/// `Some("")` counts as absent everywhere the schema is concerned.
trait EmptyCheck {
    fn is_none_or_empty(&self) -> bool;
}

impl EmptyCheck for Option<&str> {
    fn is_none_or_empty(&self) -> bool {
        self.map_or(true, |s| s.trim().is_empty())
    }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_invoice() -> InvoiceData {
        InvoiceData {
            invoice_number: Some("INV-1001".to_string()),
            date: Some("2025-11-03".to_string()),
            vendor_name: Some("Acme Paper Oy".to_string()),
            total_amount: Some(250.0),
            line_items: Some(vec![LineItem {
                description: Some("A4 paper, 10 reams".to_string()),
                quantity: Some(10.0),
                unit_price: Some(25.0),
                total_price: Some(250.0),
            }]),
        }
    }

    #[test]
    fn valid_invoice_passes() {
        assert_eq!(valid_invoice().validate(), Ok(()));
    }

    #[test]
    fn missing_fields_are_named_in_feedback() {
        let invoice = InvoiceData {
            invoice_number: None,
            vendor_name: Some("".to_string()),
            ..valid_invoice()
        };
        let feedback = invoice.validate().unwrap_err();
        assert!(feedback.contains("invoice_number"));
        assert!(feedback.contains("vendor_name"));
        assert!(!feedback.contains("total_amount"));
    }

    #[test]
    fn bad_date_format_is_rejected() {
        let invoice = InvoiceData {
            date: Some("03.11.2025".to_string()),
            ..valid_invoice()
        };
        assert!(invoice.validate().unwrap_err().contains("YYYY-MM-DD"));
    }

    #[test]
    fn non_positive_total_is_rejected() {
        let invoice = InvoiceData {
            total_amount: Some(0.0),
            ..valid_invoice()
        };
        assert!(invoice.validate().is_err());
    }

    #[test]
    fn line_item_arithmetic_must_hold() {
        let mut invoice = valid_invoice();
        invoice.line_items.as_mut().unwrap()[0].total_price = Some(240.0);
        assert!(invoice
            .validate()
            .unwrap_err()
            .contains("does not match total_price"));

        // Sub-cent rounding noise is tolerated.
        let mut invoice = valid_invoice();
        let item = &mut invoice.line_items.as_mut().unwrap()[0];
        item.quantity = Some(3.0);
        item.unit_price = Some(19.99);
        item.total_price = Some(59.97);
        assert_eq!(invoice.validate(), Ok(()));
    }

    #[test]
    fn missing_line_items_key_is_rejected() {
        let bare = "{\"invoice_number\":\"INV-1\",\"date\":\"2025-01-01\",\
                    \"vendor_name\":\"V\",\"total_amount\":10.0}";
        let invoice = InvoiceData::from_json_text(bare).unwrap();
        assert!(invoice.validate().unwrap_err().contains("line_items"));

        let invoice = InvoiceData {
            line_items: Some(Vec::new()),
            ..valid_invoice()
        };
        assert_eq!(invoice.validate(), Ok(()));
    }

    #[test]
    fn code_fences_are_stripped_before_parsing() {
        let fenced = "```json\n{\"invoice_number\":\"INV-7\",\"date\":\"2025-01-01\",\
                      \"vendor_name\":\"V\",\"total_amount\":1.0,\"line_items\":[]}\n```";
        let invoice = InvoiceData::from_json_text(fenced).unwrap();
        assert_eq!(invoice.invoice_number.as_deref(), Some("INV-7"));
        assert_eq!(invoice.validate(), Ok(()));
    }
}
