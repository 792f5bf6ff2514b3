use crate::types::{AuctionSnapshot, AuctionStatus, BidEvent, Money, NotificationItem, NotificationKind};
use chrono::{DateTime, Utc};

// ANSI color codes
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";

    pub const RED: &'static str = "\x1b[31m";
    pub const WHITE: &'static str = "\x1b[37m";
    pub const GRAY: &'static str = "\x1b[90m";

    pub const BRIGHT_RED: &'static str = "\x1b[91m";
    pub const BRIGHT_GREEN: &'static str = "\x1b[92m";
    pub const BRIGHT_YELLOW: &'static str = "\x1b[93m";
    pub const BRIGHT_BLUE: &'static str = "\x1b[94m";
    pub const BRIGHT_MAGENTA: &'static str = "\x1b[95m";
    pub const BRIGHT_CYAN: &'static str = "\x1b[96m";
}

/// `36000` -> `36,000`.
pub fn format_money(amount: Money) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Countdown label such as `2d 03h`, `1h 05m 09s` or `42s`.
pub fn format_remaining(end: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (end - now).num_seconds();
    if secs <= 0 {
        return "closed".to_string();
    }
    let (days, hours, minutes, seconds) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours:02}h")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

pub struct AuctionFormatter {
    colored: bool,
}

impl AuctionFormatter {
    pub fn new(colored: bool) -> Self {
        Self { colored }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.colored {
            format!("{color}{text}{}", Colors::RESET)
        } else {
            text.to_string()
        }
    }

    fn status_color(status: AuctionStatus) -> &'static str {
        match status {
            AuctionStatus::Scheduled => Colors::BRIGHT_BLUE,
            AuctionStatus::InProgress => Colors::BRIGHT_GREEN,
            AuctionStatus::EndingSoon => Colors::BRIGHT_YELLOW,
            AuctionStatus::Ended => Colors::GRAY,
            AuctionStatus::Cancelled => Colors::BRIGHT_RED,
        }
    }

    pub fn snapshot_line(&self, snapshot: &AuctionSnapshot, now: DateTime<Utc>) -> String {
        let price = match snapshot.current_highest_bid {
            Some(high) => format_money(high),
            None => format!("{} (start)", format_money(snapshot.starting_price)),
        };
        let leader = snapshot.current_winner_nickname.as_deref().unwrap_or("-");
        let buy_now = snapshot
            .buy_it_now_price
            .map(|p| format!(" │ buy now {}", format_money(p)))
            .unwrap_or_default();
        format!(
            "#{:<6} {} │ {} by {} │ {} bids / {} bidders │ unit {}{} │ {}",
            snapshot.auction_id,
            self.paint(Self::status_color(snapshot.status), &format!("{:<11}", snapshot.status)),
            self.paint(Colors::BOLD, &price),
            leader,
            snapshot.total_bids,
            snapshot.total_bidders,
            format_money(snapshot.bid_unit),
            buy_now,
            format_remaining(snapshot.scheduled_end_time, now),
        )
    }

    pub fn bid_line(&self, bid: &BidEvent) -> String {
        let marker = match (bid.is_winning, bid.is_my_bid) {
            (true, true) => self.paint(Colors::BRIGHT_GREEN, "★ you"),
            (true, false) => self.paint(Colors::BRIGHT_CYAN, "★    "),
            (false, true) => self.paint(Colors::BRIGHT_MAGENTA, "  you"),
            (false, false) => "     ".to_string(),
        };
        format!(
            "  {} {} {:>12} {}{}",
            self.paint(Colors::GRAY, &bid.bid_time_local().format("%H:%M:%S").to_string()),
            marker,
            format_money(bid.bid_amount),
            bid.bidder_nickname,
            if bid.is_auto_bid { " (auto)" } else { "" },
        )
    }

    pub fn notification_line(&self, item: &NotificationItem) -> String {
        let color = match item.kind {
            NotificationKind::BidOutbid | NotificationKind::AuctionLost => Colors::BRIGHT_YELLOW,
            NotificationKind::AuctionWon
            | NotificationKind::BidPlaced
            | NotificationKind::PurchaseCompleted => Colors::BRIGHT_GREEN,
            NotificationKind::AuctionCancelled
            | NotificationKind::ConnectionLost
            | NotificationKind::PaymentRequired => Colors::BRIGHT_RED,
            _ => Colors::WHITE,
        };
        let unread = if item.is_read { " " } else { "●" };
        format!(
            "{} {} {} {} {}",
            self.paint(Colors::BRIGHT_BLUE, unread),
            self.paint(Colors::GRAY, &item.created_at.with_timezone(&chrono::Local).format("%m-%d %H:%M").to_string()),
            self.paint(color, &item.title),
            item.message,
            self.paint(Colors::DIM, &format!("[{}]", item.id)),
        )
    }
}
