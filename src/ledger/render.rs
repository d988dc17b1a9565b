//! Outbound quote message rendering
//!
//! Pure formatting from stored quote fields to the text sent over the
//! channel. Kept out of the I/O path so resends can rebuild the exact
//! message from the ledger row without any caller-side re-rendering.

use super::store::LineItem;

/// Render the outbound text for a quote.
///
/// Used for the first send of a text quote when the caller does not supply
/// a pre-rendered message, and for every text resend.
pub fn quote_message(customer_name: &str, line_items: &[LineItem], total_amount: f64) -> String {
    let mut out = String::new();
    out.push_str(&format!("Quote for {customer_name}\n\n"));
    for item in line_items {
        out.push_str(&format!(
            "{} x {} @ {} = {}\n",
            format_quantity(item.quantity),
            item.description,
            format_amount(item.unit_price),
            format_amount(item.total),
        ));
    }
    out.push_str(&format!("\nTotal: {}\n", format_amount(total_amount)));
    out
}

fn format_amount(value: f64) -> String {
    format!("{value:.2}")
}

/// Whole quantities print without a decimal tail
fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_message_layout() {
        let items = vec![
            LineItem {
                description: "Cement bag 50kg".to_string(),
                quantity: 10.0,
                unit_price: 8.5,
                total: 85.0,
            },
            LineItem {
                description: "Sand (m3)".to_string(),
                quantity: 2.5,
                unit_price: 30.0,
                total: 75.0,
            },
        ];

        let message = quote_message("Acme Hardware", &items, 160.0);
        assert_eq!(
            message,
            "Quote for Acme Hardware\n\n\
             10 x Cement bag 50kg @ 8.50 = 85.00\n\
             2.50 x Sand (m3) @ 30.00 = 75.00\n\n\
             Total: 160.00\n"
        );
    }

    #[test]
    fn test_quote_message_no_items() {
        let message = quote_message("Acme", &[], 0.0);
        assert!(message.starts_with("Quote for Acme\n"));
        assert!(message.ends_with("Total: 0.00\n"));
    }
}
