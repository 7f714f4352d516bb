use crate::rendering::Renderer;
use crate::state::{reduce, ClientBattleState, ClientEvent, ClientPhase, PendingSubmission};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{read_frame, write_frame, ClientMessage, ServerMessage, TopicKey, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

/// How the terminal client picks its answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    /// Option indexes typed on stdin
    Stdin,
    /// A random option as soon as a step opens
    Auto,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub token: String,
    pub topic: TopicKey,
    pub skill_rating: Option<u32>,
    pub answers: AnswerMode,
    pub heartbeat_interval: Duration,
    /// Ask the server for a replay after this long without any event
    pub sync_after: Duration,
    /// Print the state as it changes
    pub render: bool,
}

pub struct Client {
    options: ClientOptions,
    state: ClientBattleState,
    next_request_id: u32,
    renderer: Renderer,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Client {
            options,
            state: ClientBattleState::new(),
            next_request_id: 1,
            renderer: Renderer::new(),
        }
    }

    pub fn state(&self) -> &ClientBattleState {
        &self.state
    }

    fn apply(&mut self, event: ClientEvent) {
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, &event);
        if self.options.render {
            self.renderer.render(&self.state);
        }
    }

    async fn send(
        writer: &mut OwnedWriteHalf,
        message: &ClientMessage,
    ) -> Result<(), Box<dyn std::error::Error>> {
        write_frame(writer, message).await?;
        Ok(())
    }

    async fn submit(
        &mut self,
        writer: &mut OwnedWriteHalf,
        selected_option_index: usize,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !self.state.can_submit() {
            debug!("Not accepting an answer right now");
            return Ok(());
        }

        let submission = PendingSubmission {
            request_id: self.next_request_id,
            step_index: self.state.current_step_index,
            selected_option_index,
        };
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.apply(ClientEvent::SubmitRequested(submission));

        Self::send(
            writer,
            &ClientMessage::SubmitAnswer {
                request_id: submission.request_id,
                step_index: submission.step_index,
                selected_option_index,
            },
        )
        .await
    }

    /// Picks a random option when auto-answering and a step is open
    async fn maybe_auto_answer(
        &mut self,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if self.options.answers != AnswerMode::Auto || !self.state.can_submit() {
            return Ok(());
        }
        let options = self
            .state
            .current_step
            .as_ref()
            .map(|step| step.options.len())
            .unwrap_or(0);
        if options == 0 {
            return Ok(());
        }
        let choice = rand::thread_rng().gen_range(0..options);
        self.submit(writer, choice).await
    }

    /// Plays one match and returns the final state
    pub async fn run(&mut self) -> Result<ClientBattleState, Box<dyn std::error::Error>> {
        info!("Connecting to {}", self.options.server_addr);
        let stream = TcpStream::connect(&self.options.server_addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        // Reader task: forwards decoded server messages until the stream ends
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerMessage>();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, ServerMessage>(&mut reader).await {
                    Ok(Some(message)) => {
                        if event_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Error reading from server: {}", e);
                        break;
                    }
                }
            }
        });

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        if self.options.answers == AnswerMode::Stdin {
            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        } else {
            drop(line_tx);
        }

        Self::send(
            &mut writer,
            &ClientMessage::Authenticate {
                token: self.options.token.clone(),
                client_version: PROTOCOL_VERSION,
            },
        )
        .await?;
        Self::send(
            &mut writer,
            &ClientMessage::Enqueue {
                topic: self.options.topic.clone(),
                skill_rating: self.options.skill_rating,
            },
        )
        .await?;

        let mut heartbeat = interval(self.options.heartbeat_interval);
        let mut sync_check = interval(self.options.sync_after);
        let mut last_event = Instant::now();
        let mut stdin_open = self.options.answers == AnswerMode::Stdin;

        loop {
            tokio::select! {
                message = event_rx.recv() => {
                    let Some(message) = message else {
                        warn!("Server closed the connection");
                        self.apply(ClientEvent::ConnectionLost);
                        break;
                    };
                    last_event = Instant::now();
                    debug!("Received {}", message.kind());
                    self.apply(ClientEvent::Server(message));

                    match self.state.phase {
                        ClientPhase::Finished | ClientPhase::Disconnected => break,
                        _ => self.maybe_auto_answer(&mut writer).await?,
                    }
                },

                _ = heartbeat.tick() => {
                    Self::send(&mut writer, &ClientMessage::Heartbeat).await?;
                },

                // Polling fallback in case pushed events were lost
                _ = sync_check.tick() => {
                    let in_match = matches!(self.state.phase, ClientPhase::MatchFound | ClientPhase::InBattle);
                    if in_match && last_event.elapsed() >= self.options.sync_after {
                        debug!("No events for {:?}, requesting sync", last_event.elapsed());
                        Self::send(&mut writer, &ClientMessage::SyncRequest).await?;
                    }
                },

                line = line_rx.recv(), if stdin_open => {
                    match line {
                        Some(line) => match line.trim().parse::<usize>() {
                            Ok(choice) => self.submit(&mut writer, choice).await?,
                            Err(_) => println!("Type the number of an option"),
                        },
                        None => stdin_open = false,
                    }
                },
            }
        }

        if self.state.phase == ClientPhase::Finished {
            let _ = Self::send(&mut writer, &ClientMessage::Disconnect).await;
        }
        Ok(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        EndReason, Identity, MatchId, MatchSummary, Phase, QuestionId, QuestionStem, Role, RoundId,
        StepView,
    };
    use tokio::net::TcpListener;

    async fn expect_client(stream: &mut TcpStream) -> ClientMessage {
        loop {
            let message = read_frame::<_, ClientMessage>(stream)
                .await
                .unwrap()
                .expect("client hung up");
            if message != ClientMessage::Heartbeat {
                return message;
            }
        }
    }

    /// Scripted server: one single-step round, answers acknowledged, then the end
    async fn scripted_server(listener: TcpListener) -> Vec<ClientMessage> {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = vec![expect_client(&mut stream).await];
        received.push(expect_client(&mut stream).await);

        let script = [
            ServerMessage::Authenticated {
                identity: Identity::new("ada"),
            },
            ServerMessage::Connected {
                match_id: MatchId(5),
                role: Role::A,
                opponent: Identity::new("bob"),
                total_rounds: 1,
            },
            ServerMessage::OpponentReady {
                opponent: Identity::new("bob"),
            },
            ServerMessage::RoundStart {
                round_id: RoundId(1),
                round_index: 1,
                question: QuestionStem {
                    id: QuestionId(1),
                    stem: "2 + 2".to_string(),
                    total_steps: 1,
                },
                thinking_ends_at: 0,
                score_a: 0,
                score_b: 0,
            },
            ServerMessage::PhaseChange {
                round_index: 1,
                phase: Phase::Choosing,
                deadline: u64::MAX,
                step_index: 0,
                total_steps: 1,
                step: Some(StepView {
                    prompt: "Add".to_string(),
                    options: vec!["4".to_string(), "5".to_string()],
                    marks: 1,
                }),
            },
        ];
        for message in &script {
            write_frame(&mut stream, message).await.unwrap();
        }

        let submission = expect_client(&mut stream).await;
        if let ClientMessage::SubmitAnswer {
            request_id,
            step_index,
            selected_option_index,
        } = &submission
        {
            write_frame(
                &mut stream,
                &ServerMessage::AnswerAcknowledged {
                    request_id: *request_id,
                    step_index: *step_index,
                    selected_option_index: *selected_option_index,
                },
            )
            .await
            .unwrap();
        }
        received.push(submission);

        let end = ServerMessage::MatchEnd {
            winner_id: Some(Identity::new("ada")),
            reason: EndReason::Completed,
            summary: MatchSummary {
                match_id: MatchId(5),
                participant_a: Identity::new("ada"),
                participant_b: Identity::new("bob"),
                score_a: 1,
                score_b: 0,
                momentum: 1,
                rounds: Vec::new(),
            },
        };
        write_frame(&mut stream, &end).await.unwrap();
        received.push(expect_client(&mut stream).await);
        received
    }

    fn options(addr: String) -> ClientOptions {
        ClientOptions {
            server_addr: addr,
            token: "ada".to_string(),
            topic: "math:algebra".parse().unwrap(),
            skill_rating: None,
            answers: AnswerMode::Auto,
            heartbeat_interval: Duration::from_millis(50),
            sync_after: Duration::from_secs(5),
            render: false,
        }
    }

    #[tokio::test]
    async fn test_auto_client_plays_scripted_match() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(scripted_server(listener));

        let mut client = Client::new(options(addr));
        let state = tokio_test::assert_ok!(client.run().await.map_err(|e| e.to_string()));

        assert_eq!(state.phase, ClientPhase::Finished);
        assert_eq!(state.won(), Some(true));
        assert!(state.selected_answer.is_some());
        assert!(state.pending.is_none());

        let received = server.await.unwrap();
        assert!(matches!(
            received[0],
            ClientMessage::Authenticate {
                client_version: PROTOCOL_VERSION,
                ..
            }
        ));
        assert!(matches!(received[1], ClientMessage::Enqueue { .. }));
        assert!(matches!(
            received[2],
            ClientMessage::SubmitAnswer {
                request_id: 1,
                step_index: 0,
                ..
            }
        ));
        assert_eq!(received[3], ClientMessage::Disconnect);
    }

    #[tokio::test]
    async fn test_client_reports_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut client = Client::new(options(addr));
        let state = client.run().await.map_err(|e| e.to_string());
        // Either the handshake write failed or the reader saw the close
        if let Ok(state) = state {
            assert_eq!(state.phase, ClientPhase::Disconnected);
        }
    }
}
