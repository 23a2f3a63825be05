//! Deterministic stand-in for the acoustic model.
//!
//! `FakeModel` emits one frame per 320 input samples (the stride of a real wav2vec2
//! feature encoder) and predicts, for each frame, the class id equal to the rounded
//! sample value at the start of that frame. With normalization disabled in the
//! processor, a waveform of constant value `2.0` therefore decodes to `"a"`.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use candle_core::{Device, Tensor};

use crate::transcription::processor::Wav2Vec2Processor;
use crate::transcription::readiness::{ModelHandle, ModelManager, ReadinessState};
use crate::transcription::wav2vec2::AcousticModel;

pub const FRAME_STRIDE: usize = 320;

/// Sample value that decodes to `"a"`.
pub const VALUE_A: f32 = 2.0;
/// Sample value that decodes to `"b"`.
pub const VALUE_B: f32 = 3.0;

pub struct FakeModel {
    vocab_size: usize,
}

impl FakeModel {
    pub fn with_vocab_size(vocab_size: usize) -> Self {
        Self { vocab_size }
    }
}

impl AcousticModel for FakeModel {
    fn forward(&self, input_values: &Tensor) -> candle_core::Result<Tensor> {
        let samples: Vec<f32> = input_values.squeeze(0)?.to_vec1()?;
        if samples.iter().any(|s| s.is_nan()) {
            return Err(candle_core::Error::Msg("NaN in input values".to_string()));
        }

        let frames = samples.len() / FRAME_STRIDE;
        let mut logits = vec![0.0f32; frames * self.vocab_size];
        for frame in 0..frames {
            let class = samples[frame * FRAME_STRIDE]
                .round()
                .clamp(0.0, (self.vocab_size - 1) as f32) as usize;
            logits[frame * self.vocab_size + class] = 1.0;
        }
        Tensor::from_vec(logits, (1, frames, self.vocab_size), input_values.device())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn receptive_field(&self) -> usize {
        400
    }
}

pub fn fake_processor() -> Wav2Vec2Processor {
    let vocab: HashMap<String, u32> = [("<pad>", 0), ("|", 1), ("a", 2), ("b", 3)]
        .into_iter()
        .map(|(token, id)| (token.to_string(), id))
        .collect();
    Wav2Vec2Processor::new(vocab, false)
}

pub fn fake_handle(device: &Device) -> ModelHandle {
    let processor = fake_processor();
    let model = FakeModel::with_vocab_size(processor.vocab_size());
    match ModelHandle::new(Box::new(model), processor, device.clone()) {
        Ok(handle) => handle,
        Err(e) => panic!("fake handle rejected: {e}"),
    }
}

/// A CPU manager that has finished loading the fake model.
pub async fn ready_manager() -> Arc<ModelManager> {
    let manager = Arc::new(ModelManager::new(Device::Cpu));
    manager.start(|device| Ok(fake_handle(device)));
    assert_eq!(manager.settle().await, ReadinessState::Ready);
    manager
}

/// `FakeModel` whose every forward pass waits for the test to open the gate.
///
/// Each message on the gate lets one forward pass through; dropping the sender opens
/// it for good.
pub struct GatedModel {
    inner: FakeModel,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl AcousticModel for GatedModel {
    fn forward(&self, input_values: &Tensor) -> candle_core::Result<Tensor> {
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = gate.recv();
        drop(gate);
        self.inner.forward(input_values)
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn receptive_field(&self) -> usize {
        self.inner.receptive_field()
    }
}

/// A ready CPU manager whose model blocks in `forward` until the returned sender
/// releases it.
pub async fn gated_manager() -> (Arc<ModelManager>, mpsc::Sender<()>) {
    let (gate_tx, gate_rx) = mpsc::channel();
    let manager = Arc::new(ModelManager::new(Device::Cpu));
    manager.start(move |device| {
        let processor = fake_processor();
        let model = GatedModel {
            inner: FakeModel::with_vocab_size(processor.vocab_size()),
            gate: Mutex::new(gate_rx),
        };
        ModelHandle::new(Box::new(model), processor, device.clone())
    });
    assert_eq!(manager.settle().await, ReadinessState::Ready);
    (manager, gate_tx)
}

/// Poll `condition` every few milliseconds, failing the test after ten seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 10s");
}

/// Write a 32-bit float WAV with every channel of every frame set to `value`.
pub fn write_constant_wav(
    path: &std::path::Path,
    value: f32,
    seconds: f32,
    sample_rate: u32,
    channels: u16,
) {
    let frames = (seconds * sample_rate as f32) as usize;
    let samples = vec![value; frames * channels as usize];
    let header = wav::Header::new(3, channels, sample_rate, 32);
    let mut file = std::fs::File::create(path).unwrap();
    wav::write(header, &wav::BitDepth::ThirtyTwoFloat(samples), &mut file).unwrap();
}
