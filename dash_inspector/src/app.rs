use std::sync::mpsc::{Receiver, Sender};
use std::time::{Duration, Instant};

use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode};
use dash_proto::ServerEvent;
use ratatui::backend::CrosstermBackend;
use ratatui::prelude::*;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::info;

use crate::ui::{draw_ui, UiState};

/// What the socket task reports to the UI thread.
#[derive(Debug)]
pub enum FeedMessage {
    Event(ServerEvent),
    Disconnected,
}

pub struct InspectorApp {
    terminal: Terminal<CrosstermBackend<std::io::Stdout>>,
    ui_state: UiState,
    receiver: UnboundedReceiver<FeedMessage>,
    shutdown_sender: Sender<()>,
    log_receiver: Receiver<String>,
    frame_interval: Duration,
}

impl InspectorApp {
    pub fn new(
        receiver: UnboundedReceiver<FeedMessage>,
        shutdown_sender: Sender<()>,
        log_receiver: Receiver<String>,
        frame_interval: Duration,
    ) -> Result<Self> {
        let stdout = std::io::stdout();
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        crossterm::terminal::enable_raw_mode()?;
        terminal.clear()?;
        terminal.hide_cursor()?;
        Ok(Self {
            terminal,
            ui_state: UiState::default(),
            receiver,
            shutdown_sender,
            log_receiver,
            frame_interval,
        })
    }

    pub fn run(mut self) -> Result<()> {
        let mut last_draw = Instant::now();

        loop {
            while let Ok(message) = self.receiver.try_recv() {
                match message {
                    FeedMessage::Event(event) => self.ui_state.push_event(event, Instant::now()),
                    FeedMessage::Disconnected => self.ui_state.connected = false,
                }
            }

            while let Ok(line) = self.log_receiver.try_recv() {
                self.ui_state.push_log(line);
            }

            if last_draw.elapsed() >= self.frame_interval {
                let now = Instant::now();
                self.terminal
                    .draw(|frame| draw_ui(frame, &self.ui_state, now))?;
                last_draw = now;
            }

            if event::poll(Duration::from_millis(10))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Char('c') => {
                            self.ui_state.logs.clear();
                            info!("log pane cleared");
                        }
                        _ => {}
                    }
                }
            }
        }

        self.terminal.show_cursor()?;
        crossterm::terminal::disable_raw_mode()?;
        let _ = self.shutdown_sender.send(());
        Ok(())
    }
}

pub fn channel() -> (UnboundedSender<FeedMessage>, UnboundedReceiver<FeedMessage>) {
    unbounded_channel()
}
