//! レスポンスストリーム
//!
//! バックエンドの出力は `OutputSink` に書き込まれます。
//! build / pull は `StreamEncoder` で1行1オブジェクトの JSON に変換され、
//! tag / inspect は `BufferSink` で生の出力として蓄積されます。

use crate::digest::resolve_digest;
use crate::error::{BuildError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// ストリームに流れるイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Log(String),
    Digest(String),
    Error(String),
}

impl StreamEvent {
    /// 改行で終わる JSON 1行
    pub fn to_json_line(&self) -> Bytes {
        let value = match self {
            StreamEvent::Log(text) => serde_json::json!({ "stream": text }),
            StreamEvent::Digest(id) => serde_json::json!({ "aux": { "ID": id } }),
            StreamEvent::Error(message) => serde_json::json!({
                "errorDetail": { "message": message },
                "error": message,
            }),
        };

        let mut line = value.to_string();
        line.push('\n');
        Bytes::from(line)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Log(_))
    }
}

/// 実行中の出力の書き込み先
#[async_trait]
pub trait OutputSink: Send {
    /// 出力チャンクを書き込む。受信側が閉じていれば `StreamClosed`
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// テキストを1行書き込む
    async fn write_line(&mut self, text: &str) -> Result<()> {
        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(Bytes::from(line)).await
    }
}

/// JSON 行ストリームへの変換
///
/// ビルドの場合は出力のコピーを保持し、終了時に digest を探す。
pub struct StreamEncoder {
    tx: mpsc::Sender<Bytes>,
    captured: Option<String>,
    terminated: bool,
}

impl StreamEncoder {
    /// pull 用（出力を保持しない）
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            captured: None,
            terminated: false,
        }
    }

    /// build 用（digest 抽出のため出力を保持する）
    pub fn capturing(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            captured: Some(String::new()),
            terminated: false,
        }
    }

    /// 保持している出力
    pub fn captured(&self) -> &str {
        self.captured.as_deref().unwrap_or("")
    }

    /// 受信側（HTTP レスポンス）が閉じたかどうか
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn send(&mut self, event: StreamEvent) -> Result<()> {
        if self.terminated {
            tracing::warn!("Dropping event after terminal event: {:?}", event);
            return Ok(());
        }
        if event.is_terminal() {
            self.terminated = true;
        }

        self.tx
            .send(event.to_json_line())
            .await
            .map_err(|_| BuildError::StreamClosed)
    }

    /// ビルドの終端イベントを送る
    ///
    /// digest が見つかれば `aux`、見つからなければ `digest not found` のエラー。
    /// 終端イベントはちょうど1つだけ送られる。
    pub async fn finish_build(&mut self, structured: Option<String>) -> Result<String> {
        match resolve_digest(structured, self.captured()) {
            Ok(digest) => {
                tracing::info!("Build produced {}", digest);
                self.send(StreamEvent::Digest(digest.clone())).await?;
                Ok(digest)
            }
            Err(e) => {
                self.send(StreamEvent::Error(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// エラーの終端イベントを送る
    pub async fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.send(StreamEvent::Error(message.into())).await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[async_trait]
impl OutputSink for StreamEncoder {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let text = String::from_utf8_lossy(&chunk).into_owned();
        if let Some(captured) = &mut self.captured {
            captured.push_str(&text);
        }
        self.send(StreamEvent::Log(text)).await
    }
}

/// 生の出力をメモリに蓄積する（tag / inspect）
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

#[async_trait]
impl OutputSink for BufferSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &Bytes) -> serde_json::Value {
        let text = std::str::from_utf8(line).unwrap();
        assert!(text.ends_with('\n'));
        serde_json::from_str(text.trim_end()).unwrap()
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<serde_json::Value> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(decode(&line));
        }
        lines
    }

    #[test]
    fn test_event_framing() {
        assert_eq!(
            decode(&StreamEvent::Log("step 1\n".to_string()).to_json_line()),
            serde_json::json!({"stream": "step 1\n"})
        );
        assert_eq!(
            decode(&StreamEvent::Digest("sha256:ab".to_string()).to_json_line()),
            serde_json::json!({"aux": {"ID": "sha256:ab"}})
        );
        assert_eq!(
            decode(&StreamEvent::Error("boom".to_string()).to_json_line()),
            serde_json::json!({"errorDetail": {"message": "boom"}, "error": "boom"})
        );
    }

    #[tokio::test]
    async fn test_build_stream_ends_with_digest() {
        let (tx, rx) = mpsc::channel(16);
        let mut encoder = StreamEncoder::capturing(tx);

        encoder.write_line("#1 building").await.unwrap();
        encoder
            .write(Bytes::from("#9 exporting manifest sha256:abc123 done\n"))
            .await
            .unwrap();
        let digest = encoder.finish_build(None).await.unwrap();
        assert_eq!(digest, "sha256:abc123");
        drop(encoder);

        let lines = drain(rx).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["stream"], "#1 building\n");
        assert_eq!(lines[2]["aux"]["ID"], "sha256:abc123");
    }

    #[tokio::test]
    async fn test_build_stream_without_digest_is_error() {
        let (tx, rx) = mpsc::channel(16);
        let mut encoder = StreamEncoder::capturing(tx);

        encoder.write_line("done").await.unwrap();
        let err = encoder.finish_build(None).await.unwrap_err();
        assert!(matches!(err, BuildError::DigestNotFound));
        drop(encoder);

        let lines = drain(rx).await;
        assert_eq!(lines.last().unwrap()["error"], "digest not found");
    }

    #[tokio::test]
    async fn test_only_one_terminal_event() {
        let (tx, rx) = mpsc::channel(16);
        let mut encoder = StreamEncoder::capturing(tx);

        encoder.fail("execute build: exit status 1").await.unwrap();
        encoder.finish_build(Some("sha256:ff".to_string())).await.unwrap();
        assert!(encoder.is_terminated());
        drop(encoder);

        let lines = drain(rx).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["error"], "execute build: exit status 1");
    }

    #[tokio::test]
    async fn test_closed_receiver_is_stream_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut encoder = StreamEncoder::new(tx);
        assert!(encoder.is_closed());

        let err = encoder.write_line("x").await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_buffer_sink() {
        let mut sink = BufferSink::new();
        sink.write(Bytes::from_static(b"{\"Name\":")).await.unwrap();
        sink.write_line("\"x\"}").await.unwrap();
        assert_eq!(sink.as_bytes(), b"{\"Name\":\"x\"}\n");
    }
}
