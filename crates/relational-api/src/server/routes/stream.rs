async fn stream_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, HttpApiError> {
    // Subscribe before reading status so no progress falls between the two.
    let rx = state.stream_tx.subscribe();
    let report = {
        let inner = state.inner.lock().await;
        status_report(&inner, &batch_id)?
    };
    let initial_message = if report.state == BatchState::Finished {
        StreamMessage::finished(&report)
    } else {
        StreamMessage::status(&report)
    };

    Ok(ws.on_upgrade(move |socket| stream_socket(socket, rx, batch_id, initial_message)))
}

async fn stream_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<StreamMessage>,
    batch_id: String,
    initial_message: StreamMessage,
) {
    if send_stream_message(&mut socket, &initial_message)
        .await
        .is_err()
        || initial_message.is_terminal()
    {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(message) => {
                        if message.batch_id != batch_id {
                            continue;
                        }

                        if send_stream_message(&mut socket, &message).await.is_err() {
                            break;
                        }
                        if message.is_terminal() {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let warning = StreamMessage::warning(
                            &batch_id,
                            format!("stream client lagged and skipped {skipped} message(s)"),
                        );

                        if send_stream_message(&mut socket, &warning).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

async fn send_stream_message(
    socket: &mut WebSocket,
    message: &StreamMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

#[derive(Debug, Clone, Serialize)]
struct StreamMessage {
    schema_version: String,
    #[serde(rename = "type")]
    message_type: String,
    batch_id: String,
    payload: Value,
}

impl StreamMessage {
    const FINISHED: &'static str = "batch.finished";

    fn status(report: &BatchStatusReport) -> Self {
        Self::new("batch.status", &report.batch_id, to_payload(report))
    }

    fn progress(event: &ProgressEvent) -> Self {
        Self::new("batch.progress", &event.batch_id, to_payload(event))
    }

    fn finished(report: &BatchStatusReport) -> Self {
        Self::new(Self::FINISHED, &report.batch_id, to_payload(report))
    }

    fn warning(batch_id: &str, warning: String) -> Self {
        Self::new("warning", batch_id, json!({ "message": warning }))
    }

    fn new(message_type: &str, batch_id: &str, payload: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: message_type.to_string(),
            batch_id: batch_id.to_string(),
            payload,
        }
    }

    fn is_terminal(&self) -> bool {
        self.message_type == Self::FINISHED
    }
}

fn to_payload(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
