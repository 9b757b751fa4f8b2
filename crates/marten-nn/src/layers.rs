use rand::rngs::StdRng;

use marten_core::{Error, Float, Result, Shape};

use crate::init::ForgetParam;
use crate::module::Module;
use crate::parameter::Parameter;
use crate::state::State;

// Layers — Sequential container with branches and a memory-optimized mode
//
// A Layers holds an ordered list of owned modules plus one hidden-state
// slot per module (`hiddens.len() == modules.len()`, always). During fprop,
// module i writes into hiddens[i] — lazily allocated at the shape the
// module's own size relation predicts — except the last module, which
// writes into the caller's output buffer.
//
// BRANCHES: a sub-module that reports `is_branch_container()` consumes the
// current input like any other module, but its output leaves through its
// OWN side buffer (`intern_out`) and the main path's current-input pointer
// does not advance past it. That is how the graph fans out (multi-task
// heads, skip taps) without disturbing the main pipeline. A container whose
// `branch` flag is set routes its final module into `intern_out` instead of
// the caller's output.
//
// MEMORY-OPTIMIZED MODE: `optimize_fprop` ping-pongs between the caller's
// two buffers instead of allocating one hidden state per stage. The price
// is that the hidden activations the backward passes need are gone —
// the container remembers (`memoptimized`) and refuses bprop/bbprop from
// then on. The return value tells the caller which buffer holds the final
// output: the result lands in `out` after an odd number of main-path
// stages and back in `in` after an even number.
//
// BACKWARD: modules run in reverse registration order, threading the same
// hidden buffers the forward pass used. All intermediate gradient buffers
// are cleared once at entry — by the MAIN path only; a branch container
// relies on its owner having cleared (ownership of clearing flows from the
// main path down, never the reverse).

/// Which buffer a pipeline step reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// The caller-supplied input state.
    Input,
    /// Hidden slot i (also the throwaway target of a branch step).
    Hidden(usize),
    /// The container's output: the caller's buffer, or `intern_out` for a
    /// branch container.
    Output,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    input: Slot,
    output: Slot,
    branch: bool,
}

/// Ordered pipeline of modules with hidden-state plumbing.
pub struct Layers<T: Float> {
    modules: Vec<Box<dyn Module<T>>>,
    hiddens: Vec<Option<State<T>>>,
    branch: bool,
    intern_out: Option<State<T>>,
    memoptimized: bool,
}

impl<T: Float> Layers<T> {
    /// An empty main-path container.
    pub fn new() -> Self {
        Layers {
            modules: Vec::new(),
            hiddens: Vec::new(),
            branch: false,
            intern_out: None,
            memoptimized: false,
        }
    }

    /// An empty branch container: its output leaves through `intern_out`.
    pub fn new_branch() -> Self {
        Layers {
            branch: true,
            ..Layers::new()
        }
    }

    /// Append an owned module (and its hidden-state slot).
    pub fn add_module(&mut self, module: Box<dyn Module<T>>) {
        self.modules.push(module);
        self.hiddens.push(None);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The side output of a branch container (populated by fprop).
    pub fn intern_output(&self) -> Option<&State<T>> {
        self.intern_out.as_ref()
    }

    /// Mutable access to the side output, e.g. to seed its gradient before
    /// a backward pass through the branch.
    pub fn intern_output_mut(&mut self) -> Option<&mut State<T>> {
        self.intern_out.as_mut()
    }

    pub fn is_memoptimized(&self) -> bool {
        self.memoptimized
    }

    /// Buffer routing for the current module list. The last module that is
    /// not a branch writes the container output; branch steps park a dummy
    /// in their own hidden slot and do not advance the current input.
    fn plan(&self) -> Vec<Step> {
        let n = self.modules.len();
        let last_main = (0..n).rev().find(|&i| !self.modules[i].is_branch_container());
        let mut steps = Vec::with_capacity(n);
        let mut cur = Slot::Input;
        for i in 0..n {
            if self.modules[i].is_branch_container() {
                steps.push(Step {
                    input: cur,
                    output: Slot::Hidden(i),
                    branch: true,
                });
            } else if Some(i) == last_main {
                steps.push(Step {
                    input: cur,
                    output: Slot::Output,
                    branch: false,
                });
                cur = Slot::Output;
            } else {
                steps.push(Step {
                    input: cur,
                    output: Slot::Hidden(i),
                    branch: false,
                });
                cur = Slot::Hidden(i);
            }
        }
        steps
    }

    /// Shape currently held by an input slot.
    fn slot_shape(&self, slot: Slot, input: &State<T>) -> Shape {
        match slot {
            Slot::Input => input.shape().clone(),
            Slot::Hidden(j) => self.hiddens[j]
                .as_ref()
                .map(|s| s.shape().clone())
                .unwrap_or_else(|| Shape::from(1)),
            Slot::Output => Shape::from(1),
        }
    }

    fn clear_hiddens(&mut self, curvature: bool) {
        for h in self.hiddens.iter_mut().flatten() {
            if curvature {
                h.zero_ddx();
            } else {
                h.zero_dx();
            }
        }
        // intern_out is a branch OUTPUT, seeded by whoever consumes it —
        // never cleared here. Children clear their own hiddens through the
        // recursive capability call.
        for m in self.modules.iter_mut() {
            if curvature {
                m.clear_hidden_curvatures();
            } else {
                m.clear_hidden_grads();
            }
        }
    }

    fn run_backward(
        &mut self,
        i: usize,
        input: &mut State<T>,
        output: &mut State<T>,
        curvature: bool,
    ) -> Result<()> {
        if curvature {
            self.modules[i].bbprop(input, output)
        } else {
            self.modules[i].bprop(input, output)
        }
    }

    fn take_intern(&mut self) -> Result<State<T>> {
        self.intern_out
            .take()
            .ok_or_else(|| Error::msg("layers: branch backward before forward"))
    }

    fn backward(
        &mut self,
        input: &mut State<T>,
        output: &mut State<T>,
        curvature: bool,
    ) -> Result<()> {
        if self.modules.is_empty() {
            return Err(Error::EmptyContainer);
        }
        if self.memoptimized {
            return Err(Error::MemoryOptimized);
        }
        if !self.branch {
            self.clear_hiddens(curvature);
        }
        let steps = self.plan();
        for (i, step) in steps.iter().enumerate().rev() {
            let mut out_taken: Option<State<T>> = match step.output {
                Slot::Hidden(j) => Some(
                    self.hiddens[j]
                        .take()
                        .ok_or_else(|| Error::msg("layers: backward pass before forward pass"))?,
                ),
                Slot::Output => None,
                Slot::Input => unreachable!("plan never writes the input slot"),
            };
            let mut in_taken: Option<State<T>> = match step.input {
                Slot::Hidden(j) => Some(
                    self.hiddens[j]
                        .take()
                        .ok_or_else(|| Error::msg("layers: backward pass before forward pass"))?,
                ),
                Slot::Input => None,
                // A branch registered after the last main module taps the
                // container output itself.
                Slot::Output => None,
            };
            // Four legal routings. The container output resolves to
            // intern_out for a branch container, the caller's buffer
            // otherwise; a branch step reads the output slot when it taps
            // the value AFTER the last main module.
            let res = match (in_taken.as_mut(), out_taken.as_mut()) {
                (Some(i_s), Some(o_s)) => self.run_backward(i, i_s, o_s, curvature),
                (Some(i_s), None) => {
                    if self.branch {
                        let mut o = self.take_intern()?;
                        let r = self.run_backward(i, i_s, &mut o, curvature);
                        self.intern_out = Some(o);
                        r
                    } else {
                        self.run_backward(i, i_s, output, curvature)
                    }
                }
                (None, Some(o_s)) => match step.input {
                    Slot::Input => self.run_backward(i, input, o_s, curvature),
                    Slot::Output => {
                        if self.branch {
                            let mut o = self.take_intern()?;
                            let r = self.run_backward(i, &mut o, o_s, curvature);
                            self.intern_out = Some(o);
                            r
                        } else {
                            self.run_backward(i, output, o_s, curvature)
                        }
                    }
                    Slot::Hidden(_) => unreachable!("hidden inputs are taken above"),
                },
                (None, None) => {
                    if self.branch {
                        let mut o = self.take_intern()?;
                        let r = self.run_backward(i, input, &mut o, curvature);
                        self.intern_out = Some(o);
                        r
                    } else {
                        self.run_backward(i, input, output, curvature)
                    }
                }
            };
            if let Slot::Hidden(j) = step.output {
                self.hiddens[j] = out_taken;
            }
            if let Slot::Hidden(j) = step.input {
                self.hiddens[j] = in_taken;
            }
            res?;
        }
        Ok(())
    }

    /// Two-buffer ping-pong forward pass: no hidden states are allocated,
    /// stages alternate between the caller's `input` and `output` buffers.
    /// Marks the container memory-optimized — bprop/bbprop are a fatal
    /// error afterwards. Returns `true` when the final output landed in
    /// `output`, `false` when it landed back in `input`; callers must check
    /// and read the right buffer.
    pub fn optimize_fprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<bool> {
        if self.modules.is_empty() {
            return Err(Error::EmptyContainer);
        }
        self.memoptimized = true;
        let steps = self.plan();
        let mut swapped = false;
        for (i, step) in steps.iter().enumerate() {
            if step.branch {
                // Branch output goes to its own side buffer either way; the
                // dummy hidden slot is just a placeholder target.
                if self.hiddens[i].is_none() {
                    self.hiddens[i] = Some(State::with_curvature(1)?);
                }
                let mut dummy = self.hiddens[i].take().expect("dummy allocated above");
                let res = {
                    let src: &State<T> = if swapped { output } else { input };
                    self.modules[i].fprop(src, &mut dummy)
                };
                self.hiddens[i] = Some(dummy);
                res?;
                continue;
            }
            // Pre-size the destination: module resize cannot change order,
            // but a re-purposed ping-pong buffer may have to.
            let osh = {
                let src: &State<T> = if swapped { output } else { input };
                let mut s = src.shape().clone();
                self.modules[i].fprop_size(&mut s)?
            };
            if swapped {
                input.adapt(osh)?;
                self.modules[i].fprop(output, input)?;
            } else {
                output.adapt(osh)?;
                self.modules[i].fprop(input, output)?;
            }
            swapped = !swapped;
        }
        Ok(swapped)
    }
}

impl<T: Float> Default for Layers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Float> Module<T> for Layers<T> {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        if self.modules.is_empty() {
            return Err(Error::EmptyContainer);
        }
        let steps = self.plan();
        for (i, step) in steps.iter().enumerate() {
            // Lazily allocate this step's output buffer at the predicted
            // shape so the module's own resize is a no-op.
            match step.output {
                Slot::Hidden(j) => {
                    if self.hiddens[j].is_none() {
                        let st = if step.branch {
                            State::with_curvature(1)?
                        } else {
                            let mut s = self.slot_shape(step.input, input);
                            let osh = self.modules[i].fprop_size(&mut s)?;
                            State::with_curvature(osh)?
                        };
                        self.hiddens[j] = Some(st);
                    }
                }
                Slot::Output if self.branch => {
                    if self.intern_out.is_none() {
                        let mut s = self.slot_shape(step.input, input);
                        let osh = self.modules[i].fprop_size(&mut s)?;
                        self.intern_out = Some(State::with_curvature(osh)?);
                    }
                }
                Slot::Output => {
                    let mut s = self.slot_shape(step.input, input);
                    let osh = self.modules[i].fprop_size(&mut s)?;
                    output.adapt(osh)?;
                }
                Slot::Input => unreachable!("plan never writes the input slot"),
            }

            match step.output {
                Slot::Hidden(j) => {
                    let mut out_state = self.hiddens[j].take().expect("allocated above");
                    let res = {
                        let in_ref: &State<T> = match step.input {
                            Slot::Input => input,
                            Slot::Hidden(k) => {
                                self.hiddens[k].as_ref().expect("hidden input present")
                            }
                            // A branch after the last main module taps the
                            // container output.
                            Slot::Output => {
                                if self.branch {
                                    self.intern_out.as_ref().expect("output written above")
                                } else {
                                    &*output
                                }
                            }
                        };
                        self.modules[i].fprop(in_ref, &mut out_state)
                    };
                    self.hiddens[j] = Some(out_state);
                    res?;
                }
                Slot::Output if self.branch => {
                    let mut out_state = self.intern_out.take().expect("allocated above");
                    let res = {
                        let in_ref: &State<T> = match step.input {
                            Slot::Input => input,
                            Slot::Hidden(k) => {
                                self.hiddens[k].as_ref().expect("hidden input present")
                            }
                            Slot::Output => unreachable!(),
                        };
                        self.modules[i].fprop(in_ref, &mut out_state)
                    };
                    self.intern_out = Some(out_state);
                    res?;
                }
                Slot::Output => {
                    let in_ref: &State<T> = match step.input {
                        Slot::Input => input,
                        Slot::Hidden(k) => self.hiddens[k].as_ref().expect("hidden input present"),
                        Slot::Output => unreachable!(),
                    };
                    self.modules[i].fprop(in_ref, output)?;
                }
                Slot::Input => unreachable!(),
            }
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.backward(input, output, false)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.backward(input, output, true)
    }

    fn forget(&mut self, rng: &mut StdRng, init: ForgetParam) -> Result<()> {
        if self.modules.is_empty() {
            return Err(Error::EmptyContainer);
        }
        for m in self.modules.iter_mut() {
            m.forget(rng, init)?;
        }
        Ok(())
    }

    fn normalize(&mut self) -> Result<()> {
        if self.modules.is_empty() {
            return Err(Error::EmptyContainer);
        }
        for m in self.modules.iter_mut() {
            m.normalize()?;
        }
        Ok(())
    }

    /// Fold the per-module shape relation forward, skipping branches (their
    /// shapes are local and do not constrain the main path).
    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        let mut cur = input.clone();
        for i in 0..self.modules.len() {
            if self.modules[i].is_branch_container() {
                continue;
            }
            cur = self.modules[i].fprop_size(&mut cur)?;
        }
        *input = Module::<T>::bprop_size(self, &cur)?;
        Ok(cur)
    }

    /// Fold the per-module shape relation in reverse, skipping branches.
    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        let mut cur = output.clone();
        for i in (0..self.modules.len()).rev() {
            if self.modules[i].is_branch_container() {
                continue;
            }
            cur = self.modules[i].bprop_size(&cur)?;
        }
        Ok(cur)
    }

    fn is_branch_container(&self) -> bool {
        self.branch
    }

    fn clear_hidden_grads(&mut self) {
        self.clear_hiddens(false);
    }

    fn clear_hidden_curvatures(&mut self) {
        self.clear_hiddens(true);
    }

    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        let mut copy = if self.branch {
            Layers::new_branch()
        } else {
            Layers::new()
        };
        for m in &self.modules {
            copy.add_module(m.replicate(param)?);
        }
        Ok(Box::new(copy))
    }

    fn describe(&self) -> String {
        let inner: Vec<String> = self.modules.iter().map(|m| m.describe()).collect();
        if self.branch {
            format!("branch [ {} ]", inner.join(" -> "))
        } else {
            format!("layers [ {} ]", inner.join(" -> "))
        }
    }
}
