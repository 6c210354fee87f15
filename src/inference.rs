use anyhow::{anyhow, Result};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use ort::Session;
use std::path::Path;

/// Frame-wise regression network: one input feature vector per frame in, one
/// output feature vector per frame out.
pub struct FrameRegressor {
    session: Session,
    input_name: &'static str,
    output_name: String,
}

impl FrameRegressor {
    pub fn load(model: &Path, input_name: &str, output_name: &str) -> Result<Self> {
        let session = Session::builder()?.with_model_from_file(model)?;
        Ok(Self {
            session,
            input_name: Box::leak(input_name.to_string().into_boxed_str()),
            output_name: output_name.to_string(),
        })
    }

    pub fn forward(&self, inputs: Array2<f32>) -> Result<Array2<f32>> {
        let frames = inputs.nrows();
        let input_tensors = ort::inputs![self.input_name => inputs]?;
        let output_tensors = self.session.run(input_tensors)?;
        let output = output_tensors[self.output_name.as_str()]
            .extract_tensor::<f32>()?
            .view()
            .to_owned()
            .into_raw_vec();

        if frames == 0 || output.len() % frames != 0 {
            return Err(anyhow!(
                "network returned {} values for {} frames",
                output.len(),
                frames
            ));
        }
        let dim = output.len() / frames;
        Ok(Array2::from_shape_vec((frames, dim), output)?)
    }

    /// Forwards every utterance in one pass and hands back one output matrix
    /// per utterance, in input order.
    pub fn forward_batch(&self, utterances: &[Array2<f32>]) -> Result<Vec<Array2<f32>>> {
        run_batched(utterances, |batch| self.forward(batch))
    }
}

/// Concatenates the utterances along the frame axis, calls `forward` once and
/// splits the result back. A batch without any frame never reaches `forward`;
/// every utterance then gets an empty output.
pub fn run_batched(
    utterances: &[Array2<f32>],
    forward: impl FnOnce(Array2<f32>) -> Result<Array2<f32>>,
) -> Result<Vec<Array2<f32>>> {
    if utterances.iter().all(|u| u.nrows() == 0) {
        return Ok(utterances.iter().map(|_| Array2::zeros((0, 0))).collect());
    }
    let views: Vec<ArrayView2<f32>> = utterances.iter().map(|u| u.view()).collect();
    let batch = concatenate(Axis(0), &views)?;
    let outputs = forward(batch)?;
    Ok(split_frames(&outputs, utterances.iter().map(|u| u.nrows())))
}

pub fn split_frames(
    outputs: &Array2<f32>,
    frame_counts: impl IntoIterator<Item = usize>,
) -> Vec<Array2<f32>> {
    let mut start = 0;
    frame_counts
        .into_iter()
        .map(|count| {
            let part = outputs.slice(ndarray::s![start..start + count, ..]).to_owned();
            start += count;
            part
        })
        .collect()
}
