//! Minimal plotting registry shared by the engines of one run, and the
//! capture step that turns open figures into encoded images.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Position, INT};

use crate::feedback::escape_html;
use crate::protocol::Figure;
use crate::value::{scalar_of, Value};

const MIME_TYPE: &str = "image/svg+xml";
const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 480.0;
const MARGIN: f64 = 48.0;
const COLORS: [&str; 4] = ["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728"];

#[derive(Debug, Default)]
struct Plot {
    title: Option<String>,
    lines: Vec<(Vec<f64>, Vec<f64>)>,
}

#[derive(Debug, Default)]
struct Registry {
    /// Set by any plotting call; capture is skipped for runs that never plot
    engaged: bool,
    current: Option<INT>,
    open: BTreeMap<INT, Plot>,
}

impl Registry {
    fn current_plot(&mut self) -> &mut Plot {
        let number = match self.current {
            Some(n) => n,
            None => {
                let n = self.next_number();
                self.current = Some(n);
                n
            }
        };
        self.open.entry(number).or_default()
    }

    fn next_number(&self) -> INT {
        self.open.keys().next_back().map_or(1, |n| n + 1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Figures {
    registry: Arc<Mutex<Registry>>,
}

impl Figures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.registry.lock().engaged
    }

    fn select(&self, number: Option<INT>) -> INT {
        let mut registry = self.registry.lock();
        registry.engaged = true;
        let number = number.unwrap_or_else(|| registry.next_number());
        registry.open.entry(number).or_default();
        registry.current = Some(number);
        number
    }

    fn plot(&self, xs: Vec<f64>, ys: Vec<f64>) {
        let mut registry = self.registry.lock();
        registry.engaged = true;
        registry.current_plot().lines.push((xs, ys));
    }

    fn title(&self, text: &str) {
        let mut registry = self.registry.lock();
        registry.engaged = true;
        registry.current_plot().title = Some(text.to_string());
    }

    fn close(&self, number: Option<INT>) {
        let mut registry = self.registry.lock();
        registry.engaged = true;
        let Some(number) = number.or(registry.current) else {
            return;
        };
        registry.open.remove(&number);
        if registry.current == Some(number) {
            registry.current = registry.open.keys().next_back().copied();
        }
    }

    /// Renders every open figure in figure-number order.
    ///
    /// A figure that fails to render is left out of the result.
    pub fn capture(&self) -> Vec<Figure> {
        let registry = self.registry.lock();
        if !registry.engaged {
            return Vec::new();
        }

        registry
            .open
            .iter()
            .filter_map(|(&index, plot)| match render(plot) {
                Ok(svg) => Some(Figure {
                    index,
                    mime_type: MIME_TYPE.to_string(),
                    data: STANDARD.encode(svg),
                }),
                Err(e) => {
                    log::warn!("Failed to render figure {index}, omitted: {e}");
                    None
                }
            })
            .collect()
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if lo > hi {
        (0.0, 1.0)
    } else if lo == hi {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

fn render(plot: &Plot) -> Result<String> {
    for (xs, ys) in &plot.lines {
        if xs.iter().chain(ys).any(|v| !v.is_finite()) {
            bail!("plot data contains non-finite values");
        }
    }

    let (x0, x1) = bounds(plot.lines.iter().flat_map(|(xs, _)| xs.iter().copied()));
    let (y0, y1) = bounds(plot.lines.iter().flat_map(|(_, ys)| ys.iter().copied()));
    let sx = |x: f64| MARGIN + (x - x0) / (x1 - x0) * (WIDTH - 2.0 * MARGIN);
    let sy = |y: f64| HEIGHT - MARGIN - (y - y0) / (y1 - y0) * (HEIGHT - 2.0 * MARGIN);

    let mut svg = String::new();
    writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}">"#
    )?;
    writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#)?;
    writeln!(
        svg,
        r#"<rect x="{MARGIN}" y="{MARGIN}" width="{}" height="{}" fill="none" stroke="black"/>"#,
        WIDTH - 2.0 * MARGIN,
        HEIGHT - 2.0 * MARGIN
    )?;
    if let Some(title) = &plot.title {
        writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="sans-serif" font-size="16">{}</text>"#,
            WIDTH / 2.0,
            MARGIN / 2.0,
            escape_html(title)
        )?;
    }
    for (i, (xs, ys)) in plot.lines.iter().enumerate() {
        let points = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| format!("{:.2},{:.2}", sx(x), sy(y)))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(
            svg,
            r#"<polyline points="{points}" fill="none" stroke="{}" stroke-width="1.5"/>"#,
            COLORS[i % COLORS.len()]
        )?;
    }
    svg.push_str("</svg>\n");
    Ok(svg)
}

fn series(data: &Dynamic) -> Result<Vec<f64>, Box<EvalAltResult>> {
    let value = Value::from_dynamic(data).ok();
    let reals = match &value {
        Some(Value::List(items)) => items.iter().map(real).collect(),
        Some(Value::Array(array)) if array.ndim() == 1 => (0..array.len())
            .map(|i| {
                let c = array.complex_at(i);
                (c.im == 0.0).then_some(c.re)
            })
            .collect(),
        _ => None,
    };
    reals.ok_or_else(|| {
        EvalAltResult::ErrorRuntime(
            Dynamic::from(format!(
                "plot data must be a list or 1-d array of real numbers, got '{}'",
                data.type_name()
            )),
            Position::NONE,
        )
        .into()
    })
}

fn real(value: &Value) -> Option<f64> {
    scalar_of(value).and_then(|c| (c.im == 0.0).then_some(c.re))
}

pub fn register(engine: &mut Engine, figures: &Figures) {
    let f = figures.clone();
    engine.register_fn("figure", move || f.select(None));
    let f = figures.clone();
    engine.register_fn("figure", move |number: INT| f.select(Some(number)));

    let f = figures.clone();
    engine.register_fn("plot", move |ys: Dynamic| -> Result<(), Box<EvalAltResult>> {
        let ys = series(&ys)?;
        let xs = (0..ys.len()).map(|i| i as f64).collect();
        f.plot(xs, ys);
        Ok(())
    });
    let f = figures.clone();
    engine.register_fn(
        "plot",
        move |xs: Dynamic, ys: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let (xs, ys) = (series(&xs)?, series(&ys)?);
            if xs.len() != ys.len() {
                return Err(EvalAltResult::ErrorRuntime(
                    Dynamic::from(format!(
                        "x and y must have the same length, got {} and {}",
                        xs.len(),
                        ys.len()
                    )),
                    Position::NONE,
                )
                .into());
            }
            f.plot(xs, ys);
            Ok(())
        },
    );

    let f = figures.clone();
    engine.register_fn("title", move |text: &str| f.title(text));
    let f = figures.clone();
    engine.register_fn("close", move || f.close(None));
    let f = figures.clone();
    engine.register_fn("close", move |number: INT| f.close(Some(number)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &str) -> Figures {
        let figures = Figures::new();
        let mut engine = Engine::new();
        register(&mut engine, &figures);
        engine.run(script).unwrap();
        figures
    }

    #[test]
    fn test_untouched_registry_captures_nothing() {
        let figures = run("let x = 1;");
        assert!(!figures.is_engaged());
        assert!(figures.capture().is_empty());
    }

    #[test]
    fn test_figures_in_number_order() {
        let figures = run(r#"
            figure(3);
            plot([1.0, 2.0, 3.0]);
            figure(1);
            title("first <plot>");
            plot([0, 1], [2, 3]);
        "#);
        let captured = figures.capture();
        assert_eq!(captured.iter().map(|f| f.index).collect::<Vec<_>>(), vec![1, 3]);
        assert!(captured.iter().all(|f| f.mime_type == "image/svg+xml"));

        let svg = String::from_utf8(STANDARD.decode(&captured[0].data).unwrap()).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("first &lt;plot&gt;"));
    }

    #[test]
    fn test_failed_render_is_omitted() {
        let figures = run("figure(); figure(); plot([1.0, 2.0]);");
        figures.select(Some(1));
        figures.plot(vec![0.0, 1.0], vec![1.0, f64::NAN]);
        let captured = figures.capture();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].index, 2);
    }

    #[test]
    fn test_close() {
        let figures = run("figure(); figure(); close(); plot([1.0]); close(1);");
        assert!(figures.is_engaged());
        assert!(figures.capture().is_empty());
    }
}
