use super::ui;
use crate::core::{Conversion, ProviderStatus, RateSnapshot, RequestContext};
use crate::engine::RatesEngine;
use anyhow::Result;
use chrono::DateTime;
use comfy_table::Cell;
use std::time::Duration;
use tracing::debug;

impl RateSnapshot {
    pub fn display_as_table(&self) -> String {
        let mut table = ui::new_styled_table();
        table.set_header(vec![ui::header_cell("Currency"), ui::header_cell("Rate")]);

        let mut currencies: Vec<_> = self.rates.iter().collect();
        currencies.sort_by(|a, b| a.0.cmp(b.0));
        for (currency, rate) in currencies {
            table.add_row(vec![Cell::new(currency), ui::number_cell(*rate, 6)]);
        }

        let as_of = DateTime::from_timestamp(self.timestamp, 0)
            .map_or_else(|| self.timestamp.to_string(), |dt| dt.to_rfc2822());

        format!(
            "Rates for {}\n{} {}  {} {}\n\n{}",
            ui::style_text(&self.base, ui::StyleType::Title),
            ui::style_text("Provider:", ui::StyleType::Label),
            self.provider,
            ui::style_text("As of:", ui::StyleType::Label),
            ui::style_text(&as_of, ui::StyleType::Subtle),
            table
        )
    }
}

impl Conversion {
    pub fn display(&self) -> String {
        format!(
            "{:.2} {} = {} {}\n{}",
            self.amount,
            self.from,
            ui::style_text(&format!("{:.4}", self.converted), ui::StyleType::Value),
            self.to,
            ui::style_text(
                &format!("rate {:.6} via {}", self.rate, self.provider),
                ui::StyleType::Subtle
            ),
        )
    }
}

pub fn display_provider_status(statuses: &[ProviderStatus]) -> String {
    if statuses.is_empty() {
        return ui::style_text("No providers enabled.", ui::StyleType::Error);
    }

    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Provider"),
        ui::header_cell("Enabled"),
        ui::header_cell("Priority"),
    ]);
    for status in statuses {
        table.add_row(vec![
            Cell::new(&status.name),
            ui::flag_cell(status.enabled),
            Cell::new(status.priority),
        ]);
    }
    table.to_string()
}

/// Context that ends at `timeout` or on Ctrl-C, whichever comes first.
fn interactive_context(timeout: Duration) -> RequestContext {
    let ctx = RequestContext::with_timeout(timeout);
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted, cancelling request");
            canceller.cancel();
        }
    });
    ctx
}

pub async fn show_rates(engine: &RatesEngine, base: &str, timeout: Duration) -> Result<()> {
    let ctx = interactive_context(timeout);
    let pb = ui::new_spinner(&format!("Fetching {} rates", base.to_uppercase()));
    let result = engine.get_rates(&ctx, base).await;
    pb.finish_and_clear();

    let snapshot = result?;
    println!("{}", snapshot.display_as_table());
    Ok(())
}

pub async fn show_conversion(
    engine: &RatesEngine,
    from: &str,
    to: &str,
    amount: f64,
    timeout: Duration,
) -> Result<()> {
    let ctx = interactive_context(timeout);
    let pb = ui::new_spinner(&format!("Converting {} to {}", from, to));
    let result = engine.convert(&ctx, from, to, amount).await;
    pb.finish_and_clear();

    println!("{}", result?.display());
    Ok(())
}

pub fn show_providers(engine: &RatesEngine) {
    println!("{}", display_provider_status(&engine.provider_status()));
}
