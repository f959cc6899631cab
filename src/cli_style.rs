//! Terminal styling shared by the command line tools.

use crate::job_store::JobStatus;
use clap::builder::styling::{AnsiColor, Color, Style};
use clap::builder::Styles;
use crossterm::style::{Color as CtColor, Stylize};
use unicode_width::UnicodeWidthStr;

pub fn get_styles() -> Styles {
    let heading = Style::new()
        .bold()
        .underline()
        .fg_color(Some(Color::Ansi(AnsiColor::Cyan)));
    let good = Style::new()
        .bold()
        .fg_color(Some(Color::Ansi(AnsiColor::Green)));
    let bad = Style::new()
        .bold()
        .fg_color(Some(Color::Ansi(AnsiColor::Red)));

    Styles::styled()
        .usage(heading)
        .header(heading)
        .literal(good)
        .valid(good)
        .invalid(bad)
        .error(bad)
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack))))
}

pub mod colors {
    use crossterm::style::Color;

    pub const CYAN: Color = Color::Rgb {
        r: 0,
        g: 255,
        b: 255,
    };
    pub const GREEN: Color = Color::Rgb {
        r: 0,
        g: 255,
        b: 136,
    };
    pub const ORANGE: Color = Color::Rgb {
        r: 255,
        g: 165,
        b: 0,
    };
    pub const YELLOW: Color = Color::Rgb {
        r: 255,
        g: 255,
        b: 0,
    };
    pub const RED: Color = Color::Rgb {
        r: 255,
        g: 85,
        b: 85,
    };
    pub const DIM: Color = Color::Rgb {
        r: 128,
        g: 128,
        b: 128,
    };
    pub const WHITE: Color = Color::Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
}

const CHECK: &str = "✓";
const CROSS_MARK: &str = "✗";
const HORIZONTAL: &str = "─";
const VERTICAL: &str = "│";

pub fn status_color(status: JobStatus) -> CtColor {
    match status {
        JobStatus::Pending => colors::YELLOW,
        JobStatus::InProgress => colors::CYAN,
        JobStatus::Success => colors::GREEN,
        JobStatus::Error => colors::RED,
        JobStatus::Canceled => colors::DIM,
    }
}

pub fn print_success(message: &str) {
    println!(
        " {} {}",
        CHECK.with(colors::GREEN).bold(),
        message.with(colors::GREEN)
    );
}

pub fn print_error(message: &str) {
    println!(
        " {} {}",
        CROSS_MARK.with(colors::RED).bold(),
        message.with(colors::RED)
    );
}

pub fn print_warning(message: &str) {
    println!(
        " {} {}",
        "⚠".with(colors::ORANGE).bold(),
        message.with(colors::ORANGE)
    );
}

pub fn print_section_header(title: &str) {
    let width: usize = 60;
    let side = width.saturating_sub(title.width() + 2) / 2;
    println!();
    println!(
        "{} {} {}",
        HORIZONTAL.repeat(side).with(colors::CYAN),
        title.with(colors::CYAN).bold(),
        HORIZONTAL.repeat(side).with(colors::CYAN)
    );
}

pub fn print_key_value(key: &str, value: &str) {
    println!(
        "  {} {}",
        format!("{}:", key).with(colors::DIM),
        value.with(colors::WHITE)
    );
}

pub fn print_empty_list(message: &str) {
    println!("  {}", message.with(colors::DIM).italic());
}

/// Column-aligned table; widths account for wide unicode characters.
pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    col_widths: Vec<usize>,
}

impl TableBuilder {
    pub fn new(headers: &[&str]) -> Self {
        TableBuilder {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
            col_widths: headers.iter().map(|h| h.width()).collect(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        for (width, cell) in self.col_widths.iter_mut().zip(&row) {
            *width = (*width).max(cell.width());
        }
        self.rows.push(row);
    }

    fn pad(&self, column: usize, cell: &str) -> String {
        let width = self.col_widths.get(column).copied().unwrap_or(0);
        format!("{}{}", cell, " ".repeat(width.saturating_sub(cell.width())))
    }

    fn separator(&self) -> String {
        self.col_widths
            .iter()
            .map(|w| HORIZONTAL.repeat(w + 2))
            .collect::<Vec<_>>()
            .join("┼")
    }

    pub fn print(&self) {
        let divider = VERTICAL.with(colors::CYAN).to_string();
        let header: Vec<String> = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| format!(" {} ", self.pad(i, h).with(colors::CYAN).bold()))
            .collect();
        println!("{}", header.join(divider.as_str()));
        println!("{}", self.separator().with(colors::CYAN));

        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(i, c)| format!(" {} ", self.pad(i, c)))
                .collect();
            println!("{}", cells.join(divider.as_str()));
        }
    }
}
