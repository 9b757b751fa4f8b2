use marten_core::{Error, Float, Result, Shape, Tensor};
use marten_nn::{Module, State};

use crate::bbox::{sort_by_confidence, Bbox};
use crate::resize::resize_bilinear;

// Detector — multi-resolution sliding-window detection
//
// The detector wraps one network and fprops it over a pyramid of rescaled
// copies of the input image. Feasible network input sizes are derived from
// the network's own shape relations: the MINIMUM is the input that yields
// a 1×1 output map (one receptive field), the MAXIMUM is the image size
// snapped to the nearest valid input. The pyramid is laid out between
// those two bounds by the configured policy, each entry snapped through
// `fprop_size` so every resolution is network-compatible.
//
// Per resolution the detector keeps an (input state, output state,
// content placement) tuple, rebuilt whenever the image dimensions change.
// The image is rescaled into each input buffer preserving aspect ratio;
// when the buffer's aspect differs the content is letterboxed and its
// placement recorded, because detections must be mapped back through both
// the scale factor and the letterbox offset.
//
// Detections are response-map maxima: a value above threshold that is the
// maximum of a neighborhood window sized to roughly cover one receptive
// field. Window bounds CLAMP at the map borders (the window shrinks, it
// never wraps). Within an exact-tie plateau only the first cell in scan
// order is kept, so a flat bright patch yields one detection.

/// How the detector lays out resolutions between the minimum and maximum
/// feasible network input sizes.
#[derive(Debug, Clone)]
pub enum ResolutionPolicy {
    /// N resolutions, log-spaced between min and max (clamped to the
    /// available pixel range).
    NScales(usize),
    /// Explicit scale factors applied to the maximum resolution
    /// (1.0 = full size).
    ScaleFactors(Vec<f64>),
    /// Fixed step in pixels, descending from the maximum resolution.
    Step(usize),
}

/// Per-resolution content placement inside the (possibly letterboxed)
/// network input buffer: offset and size of the valid resized image.
#[derive(Debug, Clone, Copy)]
struct ContentBox {
    off_h: usize,
    off_w: usize,
    h: usize,
    w: usize,
}

/// Multi-resolution sliding-window detector over one network.
pub struct Detector<T: Float> {
    net: Box<dyn Module<T>>,
    labels: Vec<String>,
    background: Option<usize>,
    bias: T,
    coeff: T,
    policy: ResolutionPolicy,
    // Rebuilt by init() whenever the input dimensions change.
    last_dims: Option<(usize, usize, usize)>,
    resolutions: Vec<(usize, usize)>,
    inputs: Vec<State<T>>,
    outputs: Vec<State<T>>,
    original_bboxes: Vec<ContentBox>,
}

impl<T: Float> Detector<T> {
    pub fn new(net: Box<dyn Module<T>>, labels: Vec<String>, policy: ResolutionPolicy) -> Self {
        Detector {
            net,
            labels,
            background: None,
            bias: T::ZERO,
            coeff: T::ONE,
            policy,
            last_dims: None,
            resolutions: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            original_bboxes: Vec::new(),
        }
    }

    /// Input normalization applied to every resolution's buffer:
    /// x := (x + bias) * coeff.
    pub fn set_bias_coeff(&mut self, bias: T, coeff: T) {
        self.bias = bias;
        self.coeff = coeff;
    }

    /// Exclude a class (by label) from detection results. An unknown name
    /// warns and keeps all classes.
    pub fn set_background_class(&mut self, name: &str) {
        match self.labels.iter().position(|l| l == name) {
            Some(idx) => self.background = Some(idx),
            None => {
                eprintln!(
                    "detector: warning: background class \"{}\" not found among labels, keeping all classes",
                    name
                );
            }
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The resolution table computed by the last init (network input
    /// heights/widths, largest first).
    pub fn resolutions(&self) -> &[(usize, usize)] {
        &self.resolutions
    }

    /// Compute the feasible input range and the resolution pyramid for an
    /// image of `maps`×`h`×`w`, then allocate one (input, output) state
    /// pair per resolution. Runs automatically when `fprop` sees new
    /// dimensions.
    fn init(&mut self, maps: usize, h: usize, w: usize) -> Result<()> {
        // Maximum feasible input: the image size snapped to the nearest
        // network-compatible size.
        let mut snapped = Shape::from((maps, h, w));
        let out = self.net.fprop_size(&mut snapped)?;
        let max_h = snapped.dim(1)?;
        let max_w = snapped.dim(2)?;

        // Minimum feasible input: what a single output unit sees.
        let out_maps = out.dim(0).unwrap_or(1);
        let min_shape = self.net.bprop_size(&Shape::from((out_maps, 1, 1)))?;
        let (mut min_h, mut min_w) = if min_shape.order() == 3 {
            (min_shape.dim(1)?, min_shape.dim(2)?)
        } else {
            (1, 1)
        };
        min_h = min_h.min(max_h);
        min_w = min_w.min(max_w);

        let raw: Vec<(usize, usize)> = match &self.policy {
            ResolutionPolicy::NScales(n) => {
                let requested = (*n).max(1);
                let distance = max_h - min_h;
                if distance == 0 {
                    if requested > 1 {
                        eprintln!(
                            "detector: warning: {} resolutions requested but min and max input sizes coincide, using 1",
                            requested
                        );
                    }
                    vec![(max_h, max_w)]
                } else if requested > distance {
                    eprintln!(
                        "detector: warning: {} resolutions requested but only {} pixels between {}x{} and {}x{}, clamping to 2",
                        requested, distance, min_h, min_w, max_h, max_w
                    );
                    vec![(max_h, max_w), (min_h, min_w)]
                } else if requested == 1 {
                    vec![(max_h, max_w)]
                } else {
                    // Log-spaced heights from max down to min, widths kept
                    // proportional to the maximum resolution's aspect.
                    let lmin = (min_h as f64).ln();
                    let lmax = (max_h as f64).ln();
                    (0..requested)
                        .map(|i| {
                            let t = i as f64 / (requested - 1) as f64;
                            let rh = (lmax + (lmin - lmax) * t).exp().round() as usize;
                            let rh = rh.clamp(min_h, max_h);
                            let rw = ((rh as f64 / max_h as f64) * max_w as f64).round() as usize;
                            (rh, rw.clamp(min_w, max_w))
                        })
                        .collect()
                }
            }
            ResolutionPolicy::ScaleFactors(factors) => factors
                .iter()
                .map(|f| {
                    let rh = ((max_h as f64) * f).round() as usize;
                    let rw = ((max_w as f64) * f).round() as usize;
                    (rh.clamp(min_h, max_h), rw.clamp(min_w, max_w))
                })
                .collect(),
            ResolutionPolicy::Step(step) => {
                let step = (*step).max(1);
                let mut v = Vec::new();
                let mut rh = max_h;
                loop {
                    let rw = ((rh as f64 / max_h as f64) * max_w as f64).round() as usize;
                    v.push((rh, rw.clamp(min_w, max_w)));
                    if rh < min_h + step {
                        break;
                    }
                    rh -= step;
                }
                v
            }
        };

        // Snap every raw resolution to a valid network input size and drop
        // duplicates while keeping the largest-first order.
        self.resolutions.clear();
        for (rh, rw) in raw {
            let mut s = Shape::from((maps, rh, rw));
            self.net.fprop_size(&mut s)?;
            let snapped = (s.dim(1)?, s.dim(2)?);
            if !self.resolutions.contains(&snapped) {
                self.resolutions.push(snapped);
            }
        }

        self.inputs.clear();
        self.outputs.clear();
        self.original_bboxes.clear();
        for &(rh, rw) in &self.resolutions {
            let mut in_shape = Shape::from((maps, rh, rw));
            let out_shape = self.net.fprop_size(&mut in_shape)?;
            self.inputs.push(State::forward(in_shape)?);
            self.outputs.push(State::forward(out_shape)?);

            // Aspect-preserving placement of the image content inside the
            // buffer: letterboxed and centered when the aspects differ.
            let f = (rh as f64 / h as f64).min(rw as f64 / w as f64);
            let ch = ((h as f64 * f).round() as usize).clamp(1, rh);
            let cw = ((w as f64 * f).round() as usize).clamp(1, rw);
            self.original_bboxes.push(ContentBox {
                off_h: (rh - ch) / 2,
                off_w: (rw - cw) / 2,
                h: ch,
                w: cw,
            });
        }
        Ok(())
    }

    /// Run detection over the full pyramid. Returns one bbox per retained
    /// response maximum, sorted by confidence, background class excluded.
    /// Re-initializes automatically when the image dimensions differ from
    /// the last call.
    pub fn fprop(&mut self, image: &Tensor<T>, threshold: T) -> Result<Vec<Bbox>> {
        if image.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: image.order(),
            });
        }
        let d = image.dims();
        let (maps, h, w) = (d[0], d[1], d[2]);
        if self.last_dims != Some((maps, h, w)) {
            self.init(maps, h, w)?;
            self.last_dims = Some((maps, h, w));
        }

        let mut detections = Vec::new();
        for r in 0..self.resolutions.len() {
            let content = self.original_bboxes[r];

            // Rescale the image into the valid region of this resolution's
            // buffer, then normalize: x := (x + bias) * coeff.
            let resized = resize_bilinear(image, content.h, content.w)?;
            self.inputs[r].x.clear();
            self.inputs[r]
                .x
                .narrow(1, content.off_h, content.h)?
                .narrow(2, content.off_w, content.w)?
                .copy_from(&resized)?;
            if self.bias != T::ZERO {
                self.inputs[r].x.add_scalar(self.bias);
            }
            if self.coeff != T::ONE {
                self.inputs[r].x.scale(self.coeff);
            }

            let (input, output) = (&self.inputs[r], &mut self.outputs[r]);
            self.net.fprop(input, output)?;

            self.extract_maxima(r, h, w, threshold, &mut detections)?;
        }
        sort_by_confidence(&mut detections);
        Ok(detections)
    }

    /// Cast-and-detect entry point for images in a different element type
    /// (e.g. byte images feeding a float network).
    pub fn fprop_cast<U: Float>(&mut self, image: &Tensor<U>, threshold: T) -> Result<Vec<Bbox>> {
        let cast: Tensor<T> = image.cast()?;
        self.fprop(&cast, threshold)
    }

    /// Scan one resolution's response maps for thresholded local maxima
    /// and map every retained maximum back through the three coordinate
    /// systems.
    fn extract_maxima(
        &mut self,
        r: usize,
        orig_h: usize,
        orig_w: usize,
        threshold: T,
        detections: &mut Vec<Bbox>,
    ) -> Result<()> {
        let (rh, rw) = self.resolutions[r];
        let content = self.original_bboxes[r];
        let od = self.outputs[r].dims().to_vec();
        if od.len() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: od.len(),
            });
        }
        let (classes, oh, ow) = (od[0], od[1], od[2]);

        // Receptive field and total stride of the network, derived from
        // its own shape relations: one output unit sees rf pixels, and
        // adjacent units are `step` input pixels apart.
        let rf_shape = self.net.bprop_size(&Shape::from((classes, 1, 1)))?;
        let (rf_h, rf_w) = if rf_shape.order() == 3 {
            (rf_shape.dim(1)?.min(rh), rf_shape.dim(2)?.min(rw))
        } else {
            (1, 1)
        };
        let two_shape = self.net.bprop_size(&Shape::from((classes, 2, 2)))?;
        let (step_h, step_w) = if two_shape.order() == 3 {
            (
                two_shape.dim(1)?.saturating_sub(rf_h).max(1),
                two_shape.dim(2)?.saturating_sub(rf_w).max(1),
            )
        } else {
            (1, 1)
        };

        // Neighborhood radius in output cells: half a receptive field.
        let radius_h = (rf_h / step_h / 2).max(1);
        let radius_w = (rf_w / step_w / 2).max(1);

        // Original-pixels-per-input-pixel at this resolution.
        let scaleh = orig_h as f64 / content.h as f64;
        let scalew = orig_w as f64 / content.w as f64;

        for c in 0..classes {
            if self.background == Some(c) {
                continue;
            }
            let map = self.outputs[r].x.select(0, c)?.to_vec();
            for i in 0..oh {
                for j in 0..ow {
                    let v = map[i * ow + j];
                    if !(v > threshold) {
                        continue;
                    }
                    // Clamped neighborhood window: shrinks at the borders,
                    // never wraps. Exact ties keep only the first cell in
                    // scan order.
                    let i_lo = i.saturating_sub(radius_h);
                    let i_hi = (i + radius_h + 1).min(oh);
                    let j_lo = j.saturating_sub(radius_w);
                    let j_hi = (j + radius_w + 1).min(ow);
                    let mut is_max = true;
                    'window: for ni in i_lo..i_hi {
                        for nj in j_lo..j_hi {
                            if ni == i && nj == j {
                                continue;
                            }
                            let nv = map[ni * ow + nj];
                            if nv > v || (nv == v && (ni, nj) < (i, j)) {
                                is_max = false;
                                break 'window;
                            }
                        }
                    }
                    if !is_max {
                        continue;
                    }

                    // Input-map coordinates: interpolate the maximum's
                    // position across the response map's stride.
                    let ih0 = if oh > 1 {
                        (i as f64 * (rh - rf_h) as f64 / (oh - 1) as f64).round() as usize
                    } else {
                        i * step_h
                    };
                    let iw0 = if ow > 1 {
                        (j as f64 * (rw - rf_w) as f64 / (ow - 1) as f64).round() as usize
                    } else {
                        j * step_w
                    };

                    // Original-image coordinates: undo the letterbox
                    // offset, then the resolution's scale factor.
                    let h0 = (ih0 as f64 - content.off_h as f64) * scaleh;
                    let w0 = (iw0 as f64 - content.off_w as f64) * scalew;

                    detections.push(Bbox {
                        class_id: c,
                        confidence: v.to_f64(),
                        scaleh,
                        scalew,
                        scale_index: r,
                        h0,
                        w0,
                        height: rf_h as f64 * scaleh,
                        width: rf_w as f64 * scalew,
                        iheight: rh,
                        iwidth: rw,
                        ih0,
                        iw0,
                        ih: rf_h,
                        iw: rf_w,
                        oheight: oh,
                        owidth: ow,
                        oh0: i,
                        ow0: j,
                    });
                }
            }
        }
        Ok(())
    }
}
