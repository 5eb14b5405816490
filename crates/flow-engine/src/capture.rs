//! 패킷 이벤트 소스 -- 리플레이 캡처
//!
//! 커널 캡처 대신 기록된 패킷 스트림을 재생하여 [`IngestHandle`]로 공급합니다.
//!
//! # 지원 형식
//! - `replay-jsonl`: 한 줄에 하나의 `PacketDescriptor` JSON
//! - `replay-raw`: capture-common [`PacketRecord`] 고정 크기(56바이트) 레코드 연속
//!
//! ```text
//! file ──▶ ReplayCapture::run ──▶ IngestHandle ──▶ ingest workers
//!              │
//!              └── 잘못된 레코드: 집계 후 건너뜀 (raw 잔여 바이트는 에러)
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowsentry_capture_common::{IP_VERSION_4, IP_VERSION_6, PacketRecord, RECORD_SIZE};
use flowsentry_core::config::CaptureConfig;
use flowsentry_core::error::CaptureError;
use flowsentry_core::pipeline::CaptureControl;
use flowsentry_core::types::PacketDescriptor;

use crate::error::FlowEngineError;
use crate::ingest::IngestHandle;

/// raw 리플레이 읽기 단위 (레코드 1024개)
const READ_CHUNK: usize = RECORD_SIZE * 1024;

// =============================================================================
// 레코드 코덱
// =============================================================================

/// 고정 크기 레코드 하나를 디코딩합니다.
///
/// # 에러
/// - `CaptureError::Decode`: 길이 부족 또는 알 수 없는 IP 버전
pub fn decode_record(bytes: &[u8], offset: usize) -> Result<PacketDescriptor, CaptureError> {
    if bytes.len() < RECORD_SIZE {
        return Err(CaptureError::Decode {
            offset,
            reason: format!("short record: {} of {RECORD_SIZE} bytes", bytes.len()),
        });
    }

    let mut buf = &bytes[..RECORD_SIZE];
    let ts_us = buf.get_u64_le();
    let mut src = [0u8; 16];
    buf.copy_to_slice(&mut src);
    let mut dst = [0u8; 16];
    buf.copy_to_slice(&mut dst);
    let src_port = buf.get_u16_le();
    let dst_port = buf.get_u16_le();
    let length = buf.get_u32_le();
    let header_len = buf.get_u16_le();
    let window = buf.get_u16_le();
    let protocol = buf.get_u8();
    let tcp_flags = buf.get_u8();
    let ip_version = buf.get_u8();

    let (src_ip, dst_ip) = match ip_version {
        IP_VERSION_4 => (v4(&src), v4(&dst)),
        IP_VERSION_6 => (
            IpAddr::V6(Ipv6Addr::from(src)),
            IpAddr::V6(Ipv6Addr::from(dst)),
        ),
        other => {
            return Err(CaptureError::Decode {
                offset,
                reason: format!("unknown ip version {other}"),
            });
        }
    };

    Ok(PacketDescriptor {
        ts_us,
        protocol,
        src_ip,
        src_port,
        dst_ip,
        dst_port,
        length,
        tcp_flags,
        header_len,
        window,
    })
}

fn v4(octets: &[u8; 16]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

/// 패킷 디스크립터를 고정 크기 레코드로 인코딩합니다.
///
/// IP 버전은 출발지 주소 기준입니다.
pub fn encode_record(packet: &PacketDescriptor) -> PacketRecord {
    fn octets(ip: IpAddr) -> [u8; 16] {
        let mut out = [0u8; 16];
        match ip {
            IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => out = v6.octets(),
        }
        out
    }

    PacketRecord {
        ts_us: packet.ts_us,
        src_ip: octets(packet.src_ip),
        dst_ip: octets(packet.dst_ip),
        src_port: packet.src_port,
        dst_port: packet.dst_port,
        length: packet.length,
        header_len: packet.header_len,
        window: packet.window,
        protocol: packet.protocol,
        tcp_flags: packet.tcp_flags,
        ip_version: if packet.src_ip.is_ipv4() {
            IP_VERSION_4
        } else {
            IP_VERSION_6
        },
        _pad: 0,
    }
}

/// 스트림 레코드 디코더
///
/// 임의 크기 청크를 받아 완성된 레코드만 내보냅니다.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: BytesMut,
    offset: usize,
}

impl RecordDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 읽은 바이트를 추가합니다.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 내부 버퍼에 직접 읽어 들이기 위한 가변 참조
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// 다음 완성 레코드를 디코딩합니다. 레코드가 부족하면 `None`.
    pub fn next_record(&mut self) -> Option<Result<PacketDescriptor, CaptureError>> {
        if self.buf.len() < RECORD_SIZE {
            return None;
        }
        let record = self.buf.split_to(RECORD_SIZE);
        let offset = self.offset;
        self.offset += RECORD_SIZE;
        Some(decode_record(&record, offset))
    }

    /// 스트림 종료를 확인합니다.
    ///
    /// # 에러
    /// - `CaptureError::Decode`: 잘린 레코드가 남은 경우
    pub fn finish(&self) -> Result<(), CaptureError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CaptureError::Decode {
                offset: self.offset,
                reason: format!("truncated trailing record ({} bytes)", self.buf.len()),
            })
        }
    }
}

// =============================================================================
// 리플레이 캡처
// =============================================================================

/// 리플레이 파일 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFormat {
    /// JSON lines
    JsonLines,
    /// capture-common 고정 크기 레코드
    Raw,
}

impl ReplayFormat {
    /// `capture.source` 값에서 형식을 결정합니다.
    pub fn from_source(source: &str) -> Option<Self> {
        match source {
            "replay-jsonl" => Some(Self::JsonLines),
            "replay-raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// 리플레이 결과 요약
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// 수집 큐로 보낸 레코드 수
    pub records: u64,
    /// 디코딩 실패로 건너뛴 레코드 수
    pub malformed: u64,
    /// 취소로 중단되었는지 여부
    pub cancelled: bool,
}

/// 파일 기반 리플레이 캡처
#[derive(Debug)]
pub struct ReplayCapture {
    path: PathBuf,
    format: ReplayFormat,
    attached: AtomicBool,
    finished: AtomicBool,
    records: AtomicU64,
    malformed: AtomicU64,
}

impl ReplayCapture {
    /// 새 리플레이 캡처를 생성합니다.
    pub fn new(path: impl Into<PathBuf>, format: ReplayFormat) -> Self {
        Self {
            path: path.into(),
            format,
            attached: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            records: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// `[capture]` 설정으로부터 생성합니다. 리플레이 소스가 아니면 `None`.
    ///
    /// # 에러
    /// - `FlowEngineError::Config`: 리플레이 소스인데 경로가 비어 있는 경우
    pub fn from_config(config: &CaptureConfig) -> Result<Option<Self>, FlowEngineError> {
        let Some(format) = ReplayFormat::from_source(&config.source) else {
            return Ok(None);
        };
        if config.replay_path.is_empty() {
            return Err(FlowEngineError::Config {
                field: "capture.replay_path".to_owned(),
                reason: format!("required for source '{}'", config.source),
            });
        }
        Ok(Some(Self::new(&config.replay_path, format)))
    }

    /// 리플레이 파일 경로
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 리플레이 형식
    pub fn format(&self) -> ReplayFormat {
        self.format
    }

    /// 재생이 끝났는지 여부
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 지금까지 보낸 레코드 수
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// 지금까지 건너뛴 레코드 수
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// 파일을 끝까지 재생합니다.
    ///
    /// 취소되거나 수집 큐가 닫히면 조기 종료합니다.
    ///
    /// # 에러
    /// - `FlowEngineError::Capture`: 파일 열기/읽기 실패, raw 잔여 바이트
    pub async fn run(
        &self,
        ingest: IngestHandle,
        cancel: CancellationToken,
    ) -> Result<ReplaySummary, FlowEngineError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            CaptureError::Source(format!("{}: {e}", self.path.display()))
        })?;
        info!(path = %self.path.display(), format = ?self.format, "replay started");

        let result = match self.format {
            ReplayFormat::JsonLines => self.run_jsonl(file, &ingest, &cancel).await,
            ReplayFormat::Raw => self.run_raw(file, &ingest, &cancel).await,
        };
        self.finished.store(true, Ordering::Release);

        let summary = result?;
        info!(
            records = summary.records,
            malformed = summary.malformed,
            cancelled = summary.cancelled,
            "replay finished"
        );
        Ok(summary)
    }

    async fn run_jsonl(
        &self,
        file: tokio::fs::File,
        ingest: &IngestHandle,
        cancel: &CancellationToken,
    ) -> Result<ReplaySummary, FlowEngineError> {
        let mut lines = BufReader::new(file).lines();
        let mut summary = ReplaySummary::default();
        let mut line_no: usize = 0;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                line = lines.next_line() => line,
            };
            let Some(line) = line.map_err(|e| CaptureError::Source(e.to_string()))? else {
                break;
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<PacketDescriptor>(&line) {
                Ok(packet) => {
                    if !self.forward(ingest, packet, &mut summary).await {
                        break;
                    }
                }
                Err(e) => {
                    self.skip(&mut summary);
                    warn!(line = line_no, error = %e, "malformed replay line skipped");
                }
            }
        }
        Ok(summary)
    }

    async fn run_raw(
        &self,
        mut file: tokio::fs::File,
        ingest: &IngestHandle,
        cancel: &CancellationToken,
    ) -> Result<ReplaySummary, FlowEngineError> {
        let mut decoder = RecordDecoder::new();
        let mut summary = ReplaySummary::default();

        'read: loop {
            decoder.buffer_mut().reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break 'read;
                }
                read = file.read_buf(decoder.buffer_mut()) => {
                    read.map_err(|e| CaptureError::Source(e.to_string()))?
                }
            };

            while let Some(record) = decoder.next_record() {
                match record {
                    Ok(packet) => {
                        if !self.forward(ingest, packet, &mut summary).await {
                            break 'read;
                        }
                    }
                    Err(e) => {
                        self.skip(&mut summary);
                        warn!(error = %e, "malformed capture record skipped");
                    }
                }
            }

            if read == 0 {
                decoder.finish()?;
                break;
            }
        }
        Ok(summary)
    }

    /// 패킷을 수집 큐로 보냅니다. 큐가 닫혔으면 `false`.
    async fn forward(
        &self,
        ingest: &IngestHandle,
        packet: PacketDescriptor,
        summary: &mut ReplaySummary,
    ) -> bool {
        if let Err(e) = ingest.send(packet).await {
            debug!(error = %e, "ingest closed, replay stopping");
            summary.cancelled = true;
            return false;
        }
        summary.records += 1;
        self.records.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn skip(&self, summary: &mut ReplaySummary) {
        summary.malformed += 1;
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
}

impl CaptureControl for ReplayCapture {
    fn name(&self) -> &str {
        match self.format {
            ReplayFormat::JsonLines => "replay-jsonl",
            ReplayFormat::Raw => "replay-raw",
        }
    }

    fn attach(&self) -> Result<(), CaptureError> {
        if !self.path.is_file() {
            return Err(CaptureError::AttachFailed(format!(
                "replay file not found: {}",
                self.path.display()
            )));
        }
        self.attached.store(true, Ordering::Release);
        Ok(())
    }

    fn detach(&self) -> Result<(), CaptureError> {
        self.attached.store(false, Ordering::Release);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

/// 외부에서 패킷을 직접 공급할 때 사용하는 캡처 (`source = "none"`)
#[derive(Debug, Default)]
pub struct NullCapture {
    attached: AtomicBool,
}

impl CaptureControl for NullCapture {
    fn name(&self) -> &str {
        "none"
    }

    fn attach(&self) -> Result<(), CaptureError> {
        self.attached.store(true, Ordering::Release);
        Ok(())
    }

    fn detach(&self) -> Result<(), CaptureError> {
        self.attached.store(false, Ordering::Release);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}
