use std::cmp::Ordering;

/// One detected object, with its bounding box expressed in every
/// coordinate system the pipeline touches:
///
/// * the ORIGINAL image (`h0`, `w0`, `height`, `width` — fractional, since
///   they are mapped back through the per-resolution scale factor);
/// * the NETWORK INPUT map the detection's resolution used (`ih0`, `iw0`,
///   `ih`, `iw` box inside an `iheight`×`iwidth` map);
/// * the NETWORK OUTPUT map (`oh0`, `ow0` inside `oheight`×`owidth`).
///
/// `scaleh`/`scalew` record original-pixels-per-input-pixel at this
/// resolution; `scale_index` names the resolution in the pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct Bbox {
    pub class_id: usize,
    pub confidence: f64,
    pub scaleh: f64,
    pub scalew: f64,
    pub scale_index: usize,
    // original image coordinates
    pub h0: f64,
    pub w0: f64,
    pub height: f64,
    pub width: f64,
    // network input map coordinates
    pub iheight: usize,
    pub iwidth: usize,
    pub ih0: usize,
    pub iw0: usize,
    pub ih: usize,
    pub iw: usize,
    // network output map coordinates
    pub oheight: usize,
    pub owidth: usize,
    pub oh0: usize,
    pub ow0: usize,
}

/// Sort detections by confidence, highest first.
pub fn sort_by_confidence(boxes: &mut [Bbox]) {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
}
