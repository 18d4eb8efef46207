use std::collections::VecDeque;
use std::time::Instant;

use dash_proto::{ImsAllOrders, OrderEntry, ServerEvent, StationEntry, WorldPayload};
use ratatui::layout::{Constraint, Direction, Layout, Margin};
use ratatui::prelude::Rect;
use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Frame;

use crate::interpolate::{Interpolator, RobotFrame};

pub struct UiState {
    pub world: Option<WorldPayload>,
    pub interpolator: Interpolator,
    pub orders: Option<ImsAllOrders>,
    pub logs: VecDeque<String>,
    pub max_logs: usize,
    pub connected: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            world: None,
            interpolator: Interpolator::default(),
            orders: None,
            logs: VecDeque::new(),
            max_logs: 8,
            connected: false,
        }
    }
}

impl UiState {
    pub fn push_event(&mut self, event: ServerEvent, now: Instant) {
        match event {
            ServerEvent::SetWorld(world) => {
                self.interpolator.reset();
                self.world = Some(world);
                self.connected = true;
            }
            ServerEvent::Update(update) => self.interpolator.apply(&update, now),
            ServerEvent::ImsAllOrders(orders) => self.orders = Some(orders),
        }
    }

    pub fn push_log<S: Into<String>>(&mut self, line: S) {
        let mut text: String = line.into();
        while text.ends_with('\n') || text.ends_with('\r') {
            text.pop();
        }
        if text.is_empty() {
            return;
        }
        self.logs.push_front(text);
        while self.logs.len() > self.max_logs {
            self.logs.pop_back();
        }
    }

    pub fn item_name(&self, item_id: u32) -> Option<&str> {
        self.world
            .as_ref()
            .and_then(|world| world.item_names.get(item_id as usize))
            .map(String::as_str)
    }
}

/// Text rendering of the grid with robots at their rounded frame positions.
/// Row 0 is drawn at the bottom so `y` grows upwards.
pub fn grid_lines(world: &WorldPayload, robots: &[RobotFrame<'_>]) -> Vec<String> {
    let mut rows: Vec<Vec<char>> = world
        .grid
        .iter()
        .map(|row| row.iter().map(|code| cell_glyph(*code)).collect())
        .collect();

    let mut put = |x: i64, y: i64, glyph: char| {
        if y < 0 || x < 0 {
            return;
        }
        if let Some(cell) = rows
            .get_mut(y as usize)
            .and_then(|row| row.get_mut(x as usize))
        {
            *cell = glyph;
        }
    };

    for robot in robots {
        for step in robot.path {
            put(i64::from(step.x), i64::from(step.y), '·');
        }
    }
    for robot in robots {
        let glyph = if robot.held_item_id.is_some() { 'R' } else { 'r' };
        put(robot.x.round() as i64, robot.y.round() as i64, glyph);
    }

    rows.into_iter()
        .rev()
        .map(|row| row.into_iter().collect())
        .collect()
}

fn cell_glyph(code: u8) -> char {
    match code {
        1 => '█',
        2 => 'h',
        3 => 'L',
        4 => 'S',
        _ => '.',
    }
}

pub fn draw_ui(frame: &mut Frame, state: &UiState, now: Instant) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(10),
        ])
        .split(frame.size());

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(chunks[1]);

    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[2]);

    draw_header(frame, chunks[0], state);
    draw_grid(frame, middle[0], state, now);
    draw_orders(frame, middle[1], state);
    draw_stations(frame, bottom[0], state);
    draw_logs(frame, bottom[1], state);
}

fn draw_header(frame: &mut Frame, area: Rect, state: &UiState) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Warehouse Dashboard");
    let status = if state.connected {
        Span::styled("Connected", Style::default().fg(Color::Green))
    } else {
        Span::styled("Waiting for relay", Style::default().fg(Color::Red))
    };
    let tick = state
        .interpolator
        .last_tick()
        .map_or_else(|| "-".to_string(), |t| t.to_string());
    let dt = state
        .interpolator
        .dt_s()
        .map_or_else(|| "?".to_string(), |dt| format!("{dt:.2}s"));
    let line = Line::from(vec![
        status,
        Span::raw(format!(" | tick {tick} | dt {dt} | q to exit")),
    ]);
    let text = Paragraph::new(line).wrap(Wrap { trim: true });
    frame.render_widget(block, area);
    frame.render_widget(text, inner(area));
}

fn draw_grid(frame: &mut Frame, area: Rect, state: &UiState, now: Instant) {
    let block = Block::default().borders(Borders::ALL).title("Floor");
    let lines: Vec<Line> = match &state.world {
        Some(world) => {
            let robots = state.interpolator.frame(now);
            let mut lines: Vec<Line> = grid_lines(world, &robots)
                .into_iter()
                .map(Line::from)
                .collect();
            for robot in robots.iter().filter(|robot| robot.held_item_id.is_some()) {
                let item = robot
                    .held_item_id
                    .and_then(|id| state.item_name(id).map(str::to_string))
                    .or_else(|| robot.held_item_id.map(|id| format!("item {id}")))
                    .unwrap_or_default();
                lines.push(Line::from(vec![
                    Span::styled(format!("robot {:>3}", robot.id), Style::default().fg(Color::Yellow)),
                    Span::raw(format!(" {} carrying {item}", robot.state)),
                ]));
            }
            lines
        }
        None => vec![Line::from("No world received yet")],
    };
    let paragraph = Paragraph::new(lines);
    frame.render_widget(block, area);
    frame.render_widget(paragraph, inner(area));
}

fn draw_orders(frame: &mut Frame, area: Rect, state: &UiState) {
    let block = Block::default().borders(Borders::ALL).title("Orders");
    let mut lines = Vec::new();
    if let Some(orders) = &state.orders {
        lines.push(Line::from(vec![
            Span::raw("new "),
            Span::styled(
                format!("{:>5}", orders.new_order_count),
                Style::default().fg(Color::Cyan),
            ),
            Span::raw(" | finished "),
            Span::styled(
                format!("{:>5}", orders.finished_order_count),
                Style::default().fg(Color::Magenta),
            ),
        ]));
        lines.push(Line::from(Span::styled("Waiting", Style::default().fg(Color::Yellow))));
        lines.extend(orders.new_orders.iter().map(|order| order_line(order, state)));
        lines.push(Line::from(Span::styled("Finished", Style::default().fg(Color::Yellow))));
        lines.extend(
            orders
                .finished_orders
                .iter()
                .map(|order| order_line(order, state)),
        );
    } else {
        lines.push(Line::from("No order snapshot yet"));
    }
    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(block, area);
    frame.render_widget(paragraph, inner(area));
}

fn order_line<'a>(order: &'a OrderEntry, state: &UiState) -> Line<'a> {
    let id = order
        .order_id
        .map_or_else(|| order.key.clone(), |id| format!("#{id}"));
    let items: Vec<String> = order
        .items
        .iter()
        .map(|(item, qty)| match state.item_name(*item) {
            Some(name) => format!("{qty}x {name}"),
            None => format!("{qty}x item {item}"),
        })
        .collect();
    let colour = match order.error {
        Some(_) => Color::Red,
        None => Color::White,
    };
    Line::from(vec![
        Span::styled(format!("{id:>7} "), Style::default().fg(colour)),
        Span::raw(format!("{:<11} ", order.status.as_str())),
        Span::raw(items.join(", ")),
    ])
}

fn draw_stations(frame: &mut Frame, area: Rect, state: &UiState) {
    let title = match &state.orders {
        Some(orders) => format!(
            "Stations ({} busy / {} free / {} total)",
            orders.busy_stations.len(),
            orders.free_station_keys.len(),
            orders.station_count
        ),
        None => "Stations".to_string(),
    };
    let block = Block::default().borders(Borders::ALL).title(title);
    let lines: Vec<Line> = state
        .orders
        .iter()
        .flat_map(|orders| orders.busy_stations.iter())
        .map(station_line)
        .collect();
    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(block, area);
    frame.render_widget(paragraph, inner(area));
}

fn station_line(station: &StationEntry) -> Line<'_> {
    let progress: Vec<String> = station
        .required
        .iter()
        .map(|(item, required)| {
            let delivered = station.delivered.get(item).copied().unwrap_or(0);
            format!("{item}:{delivered}/{required}")
        })
        .collect();
    let order = station
        .order
        .as_ref()
        .and_then(|order| order.order_id)
        .map_or_else(|| "-".to_string(), |id| format!("#{id}"));
    Line::from(vec![
        Span::styled(format!("{:<12}", station.key), Style::default().fg(Color::Cyan)),
        Span::raw(format!(" order {order:>6} ")),
        Span::raw(progress.join(" ")),
    ])
}

fn draw_logs(frame: &mut Frame, area: Rect, state: &UiState) {
    let block = Block::default().borders(Borders::ALL).title("Logs");
    let lines: Vec<Line> = state
        .logs
        .iter()
        .map(|entry| Line::from(Span::raw(entry)))
        .collect();
    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: false });
    frame.render_widget(block, area);
    frame.render_widget(paragraph, inner(area));
}

fn inner(area: Rect) -> Rect {
    area.inner(&Margin {
        vertical: 1,
        horizontal: 1,
    })
}
