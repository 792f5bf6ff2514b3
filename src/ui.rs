/// file: src/ui.rs
/// description: console presenter: renders engine events and reads commands from stdin
use crate::{
    engine::{AuctionEngine, AuctionPage},
    error::BidError,
    events::{BidPhase, ClientEvent, EventReceiver, ToastLevel},
    formatter::{AuctionFormatter, Colors, format_money},
    types::{AuctionId, Money},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Open(AuctionId),
    Close(AuctionId),
    Show(AuctionId),
    More(AuctionId),
    Bid {
        auction_id: AuctionId,
        amount: Money,
        auto_ceiling: Option<Money>,
    },
    Buy(AuctionId),
    List,
    Read(String),
    ReadAll,
    Clear,
    Health,
    Help,
    Quit,
}

impl UserCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let id = |index: usize| -> Result<AuctionId, String> {
            parts
                .get(index)
                .ok_or_else(|| "missing auction id".to_string())?
                .parse()
                .map_err(|_| format!("invalid auction id `{}`", parts[index]))
        };
        let amount = |index: usize| -> Result<Money, String> {
            parts
                .get(index)
                .ok_or_else(|| "missing amount".to_string())?
                .replace(',', "")
                .parse()
                .map_err(|_| format!("invalid amount `{}`", parts[index]))
        };

        match parts.first().copied() {
            Some("open") => Ok(UserCommand::Open(id(1)?)),
            Some("close") => Ok(UserCommand::Close(id(1)?)),
            Some("show") => Ok(UserCommand::Show(id(1)?)),
            Some("more") => Ok(UserCommand::More(id(1)?)),
            Some("bid") => {
                let auto_ceiling = match parts.get(3).copied() {
                    Some("auto") => Some(amount(4)?),
                    Some(other) => return Err(format!("unexpected `{other}`")),
                    None => None,
                };
                Ok(UserCommand::Bid {
                    auction_id: id(1)?,
                    amount: amount(2)?,
                    auto_ceiling,
                })
            }
            Some("buy") => Ok(UserCommand::Buy(id(1)?)),
            Some("list") => Ok(UserCommand::List),
            Some("read") => parts
                .get(1)
                .map(|id| UserCommand::Read(id.to_string()))
                .ok_or_else(|| "missing notification id".to_string()),
            Some("read-all") => Ok(UserCommand::ReadAll),
            Some("clear") => Ok(UserCommand::Clear),
            Some("health") => Ok(UserCommand::Health),
            Some("help") | Some("?") => Ok(UserCommand::Help),
            Some("quit") | Some("exit") => Ok(UserCommand::Quit),
            Some(other) => Err(format!("unknown command `{other}` (try `help`)")),
            None => Err("empty command".to_string()),
        }
    }
}

pub struct UIOptions {
    pub colored: bool,
}

pub struct ConsolePresenter {
    engine: Arc<AuctionEngine>,
    event_receiver: EventReceiver,
    formatter: AuctionFormatter,
    colored: bool,
    pages: HashMap<AuctionId, AuctionPage>,
}

impl ConsolePresenter {
    pub fn new(engine: Arc<AuctionEngine>, options: UIOptions) -> Self {
        let event_receiver = engine.subscribe_events();
        Self {
            engine,
            event_receiver,
            formatter: AuctionFormatter::new(options.colored),
            colored: options.colored,
            pages: HashMap::new(),
        }
    }

    fn color(&self, color: &'static str) -> &'static str {
        if self.colored { color } else { "" }
    }

    pub async fn open(&mut self, auction_id: AuctionId) {
        if self.pages.contains_key(&auction_id) {
            self.show(auction_id);
            return;
        }
        match self.engine.open_auction(auction_id).await {
            Ok(page) => {
                self.pages.insert(auction_id, page);
                self.print_status("OPENED", &format!("auction #{auction_id}"));
                self.show(auction_id);
            }
            Err(e) => self.print_error("OPEN FAILED", &format!("#{auction_id}: {}", e.reason())),
        }
    }

    /// Runs until `quit`, end of input or Ctrl+C. Dropping the presenter
    /// closes every open page.
    pub async fn run(&mut self) {
        self.print_startup_banner();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                event = self.event_receiver.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Presenter lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match UserCommand::parse(&line) {
                        Ok(UserCommand::Quit) => break,
                        Ok(command) => self.execute(command).await,
                        Err(message) => self.print_error("COMMAND", &message),
                    },
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    self.print_status("STOPPING", "Interrupted");
                    break;
                }
            }
        }
        self.pages.clear();
    }

    async fn execute(&mut self, command: UserCommand) {
        match command {
            UserCommand::Open(auction_id) => self.open(auction_id).await,
            UserCommand::Close(auction_id) => {
                if self.pages.remove(&auction_id).is_some() {
                    self.print_status("CLOSED", &format!("auction #{auction_id}"));
                }
            }
            UserCommand::Show(auction_id) => self.show(auction_id),
            UserCommand::More(auction_id) => match self.pages.get(&auction_id) {
                Some(page) => match page.load_more_history().await {
                    Ok(0) => self.print_status("HISTORY", "no older bids"),
                    Ok(added) => {
                        self.print_status("HISTORY", &format!("{added} older bids loaded"));
                        self.show(auction_id);
                    }
                    Err(e) => self.print_error("HISTORY", &e.reason()),
                },
                None => self.print_error("HISTORY", "open the auction first"),
            },
            UserCommand::Bid {
                auction_id,
                amount,
                auto_ceiling,
            } => {
                let result = self
                    .engine
                    .submit_bid(auction_id, amount, auto_ceiling.is_some(), auto_ceiling)
                    .await;
                if let Err(e) = result {
                    self.print_bid_error(auction_id, &e);
                }
            }
            UserCommand::Buy(auction_id) => {
                if let Err(e) = self.engine.buy_now(auction_id).await {
                    self.print_bid_error(auction_id, &e);
                }
            }
            UserCommand::List => {
                let items = self.engine.notifications().list();
                if items.is_empty() {
                    println!("  (no notifications)");
                }
                for item in &items {
                    println!("{}", self.formatter.notification_line(item));
                }
            }
            UserCommand::Read(id) => {
                if !self.engine.notifications().mark_read(&id) {
                    self.print_error("NOTIFICATIONS", &format!("no notification `{id}`"));
                }
            }
            UserCommand::ReadAll => self.engine.notifications().mark_all_read(),
            UserCommand::Clear => self.engine.notifications().clear_all(),
            UserCommand::Health => println!("{}", self.engine.health().to_json()),
            UserCommand::Help => self.print_help(),
            UserCommand::Quit => {}
        }
    }

    fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionChanged { state, retry_count } => {
                let detail = if retry_count > 0 {
                    format!("attempt {retry_count}")
                } else {
                    String::new()
                };
                self.print_status(&state.to_string(), &detail);
            }
            ClientEvent::SnapshotUpdated { auction_id } => {
                if let Some(snapshot) = self.engine.snapshot(auction_id) {
                    println!("{}", self.formatter.snapshot_line(&snapshot, Utc::now()));
                }
            }
            ClientEvent::HistoryUpdated { auction_id } => {
                if let Some(latest) = self.engine.history(auction_id).first() {
                    println!("{}", self.formatter.bid_line(latest));
                }
            }
            ClientEvent::EndingSoon { auction_id } => {
                self.print_status("ENDING SOON", &format!("auction #{auction_id}"));
            }
            ClientEvent::Toast { level, message } => {
                let color = match level {
                    ToastLevel::Info => Colors::BRIGHT_BLUE,
                    ToastLevel::Success => Colors::BRIGHT_GREEN,
                    ToastLevel::Warning => Colors::BRIGHT_YELLOW,
                    ToastLevel::Error => Colors::BRIGHT_RED,
                };
                println!("{}{}»{} {}", self.color(Colors::BOLD), self.color(color), self.color(Colors::RESET), message);
            }
            ClientEvent::NotificationAdded(item) => {
                println!("{}", self.formatter.notification_line(&item));
            }
            ClientEvent::UnreadCountChanged(count) => {
                debug!("Unread notifications: {}", count);
            }
            ClientEvent::BidStateChanged {
                auction_id,
                amount,
                phase,
            } => {
                let what = amount
                    .map(|a| format!("bid {} on #{}", format_money(a), auction_id))
                    .unwrap_or_else(|| format!("buy-it-now on #{auction_id}"));
                match phase {
                    BidPhase::Pending => self.print_status("PENDING", &what),
                    BidPhase::Succeeded => self.print_status("ACCEPTED", &what),
                    BidPhase::Failed { reason } => self.print_error("REJECTED", &format!("{what}: {reason}")),
                    BidPhase::TimedOut => self.print_error("TIMED OUT", &what),
                }
            }
            ClientEvent::ListingsInvalidated { auction_id } => {
                debug!(auction_id, "Listing views invalidated");
            }
        }
    }

    fn show(&self, auction_id: AuctionId) {
        let Some(page) = self.pages.get(&auction_id) else {
            self.print_error("SHOW", &format!("auction #{auction_id} is not open"));
            return;
        };
        match page.snapshot() {
            Some(snapshot) => println!("{}", self.formatter.snapshot_line(&snapshot, Utc::now())),
            None => println!("  #{auction_id} loading..."),
        }
        for bid in page.history() {
            println!("{}", self.formatter.bid_line(&bid));
        }
        if page.has_more_history() {
            println!("  {}… `more {auction_id}` for older bids{}", self.color(Colors::DIM), self.color(Colors::RESET));
        }
    }

    fn print_bid_error(&self, auction_id: AuctionId, error: &BidError) {
        // Server rejections and timeouts already arrive as events.
        if matches!(error, BidError::Validation(_) | BidError::AlreadySubmitting) {
            self.print_error("BID", &format!("#{auction_id}: {error}"));
        }
    }

    fn print_startup_banner(&self) {
        println!();
        println!(
            "{}{}╔══════════════════════════════════════════════════════════════╗{}",
            self.color(Colors::BOLD),
            self.color(Colors::BRIGHT_CYAN),
            self.color(Colors::RESET)
        );
        println!(
            "{}{}║                      LIVE AUCTION CLIENT                     ║{}",
            self.color(Colors::BOLD),
            self.color(Colors::BRIGHT_CYAN),
            self.color(Colors::RESET)
        );
        println!(
            "{}{}╚══════════════════════════════════════════════════════════════╝{}",
            self.color(Colors::BOLD),
            self.color(Colors::BRIGHT_CYAN),
            self.color(Colors::RESET)
        );
        println!(
            "  Version {}{}{}. Type `help` for commands.",
            self.color(Colors::BRIGHT_GREEN),
            env!("CARGO_PKG_VERSION"),
            self.color(Colors::RESET)
        );
        println!();
    }

    fn print_help(&self) {
        println!("  open <id>                      watch an auction");
        println!("  close <id>                     stop watching");
        println!("  show <id> | more <id>          print state / load older bids");
        println!("  bid <id> <amount> [auto <max>] place a bid");
        println!("  buy <id>                       buy it now");
        println!("  list | read <nid> | read-all | clear");
        println!("  health | quit");
    }

    fn print_status(&self, status: &str, message: &str) {
        let (color, symbol) = match status {
            "CONNECTING" | "RECONNECTING" | "PENDING" => (Colors::BRIGHT_YELLOW, "*"),
            "CONNECTED" | "ACCEPTED" | "OPENED" => (Colors::BRIGHT_GREEN, "+"),
            "DISCONNECTED" | "CLOSED" => (Colors::BRIGHT_RED, "X"),
            "STOPPING" | "ENDING SOON" => (Colors::BRIGHT_MAGENTA, "!"),
            _ => (Colors::WHITE, "-"),
        };
        println!(
            "{}{}[{}]{} {} {}",
            self.color(Colors::BOLD),
            self.color(color),
            status,
            self.color(Colors::RESET),
            symbol,
            message
        );
    }

    fn print_error(&self, error_type: &str, message: &str) {
        println!(
            "{}{}[{}]{} ! {}{}{}",
            self.color(Colors::BOLD),
            self.color(Colors::BRIGHT_RED),
            error_type,
            self.color(Colors::RESET),
            self.color(Colors::RED),
            message,
            self.color(Colors::RESET)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(UserCommand::parse("open 12"), Ok(UserCommand::Open(12)));
        assert_eq!(
            UserCommand::parse("bid 3 36,000"),
            Ok(UserCommand::Bid {
                auction_id: 3,
                amount: 36_000,
                auto_ceiling: None
            })
        );
        assert_eq!(
            UserCommand::parse("bid 3 36000 auto 50000"),
            Ok(UserCommand::Bid {
                auction_id: 3,
                amount: 36_000,
                auto_ceiling: Some(50_000)
            })
        );
        assert_eq!(UserCommand::parse("read abc"), Ok(UserCommand::Read("abc".into())));
        assert_eq!(UserCommand::parse("  quit "), Ok(UserCommand::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(UserCommand::parse("bid x 100").is_err());
        assert!(UserCommand::parse("bid 3").is_err());
        assert!(UserCommand::parse("bid 3 100 manual").is_err());
        assert!(UserCommand::parse("read").is_err());
        assert!(UserCommand::parse("dance").is_err());
    }
}
