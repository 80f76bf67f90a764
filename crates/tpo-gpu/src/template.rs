//! Kernel templates.

use std::fmt;
use tpo_tiling::{AxisTree, TileAxis};

/// Attributes that keep an axis from being a plain elementwise axis.
const EXCLUDED_ATTRS: [&str; 3] = ["REDUCE", "TRANSPOSE", "BROADCAST"];

/// Shape of the computation, ordered by how much it constrains mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Template {
    /// Nothing known.
    #[default]
    Default,
    /// Elementwise only.
    PureElem,
    /// Partial reduction.
    Reduction,
    /// Every axis is reduced.
    AllReduce,
    /// Contains a transposition.
    Transpose,
}

impl Template {
    /// Upper case name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::PureElem => "PURE_ELEM",
            Self::Reduction => "REDUCTION",
            Self::AllReduce => "ALL_REDUCE",
            Self::Transpose => "TRANSPOSE",
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Template of the kernel whose axes are `axes`.
#[must_use]
pub fn determine_template(axes: &AxisTree) -> Template {
    let ids = axes.top_down();
    if !ids.is_empty() && ids.iter().all(|&id| axes.axis(id).has_attr("REDUCE_AXIS")) {
        return Template::AllReduce;
    }
    let mut template = Template::PureElem;
    for &id in &ids {
        for attr in &axes.axis(id).attrs {
            if attr.key.contains("REDUCE") {
                template = template.max(Template::Reduction);
            } else if attr.key.contains("TRANSPOSE") {
                template = template.max(Template::Transpose);
            }
        }
    }
    template
}

/// Returns true if no attribute of `axis` marks it as reduced, transposed
/// or broadcast.
#[must_use]
pub fn is_elemwise_axis(axis: &TileAxis) -> bool {
    !EXCLUDED_ATTRS.iter().any(|&key| axis.has_attr_partial(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpo_tiling::AttrInfo;

    fn tree(attrs: &[&[&str]]) -> AxisTree {
        let mut axes = AxisTree::new();
        let mut parent = axes.root();
        for (dim, keys) in attrs.iter().enumerate() {
            let id = axes.add_axis(parent, 0, dim, 0, 64);
            for key in *keys {
                axes.axis_mut(id).mark_with_attr(AttrInfo::new(*key, "S_0"));
            }
            parent = id;
        }
        axes
    }

    #[test]
    fn test_templates() {
        assert_eq!(determine_template(&tree(&[&["ELEMWISE"], &["ELEMWISE"]])), Template::PureElem);
        assert_eq!(determine_template(&tree(&[&[], &["REDUCE_AXIS"]])), Template::Reduction);
        assert_eq!(determine_template(&tree(&[&["REDUCE_AXIS"]])), Template::AllReduce);
        assert_eq!(
            determine_template(&tree(&[&["TRANSPOSE"], &["REDUCE_AXIS", "TRANSPOSE"]])),
            Template::Transpose
        );
    }

    #[test]
    fn test_elemwise_axis() {
        let axes = tree(&[&["ELEMWISE"], &["BROADCAST"], &["REDUCE_DST_LAST"]]);
        let ids = axes.band_axes(0);
        assert!(is_elemwise_axis(axes.axis(ids[0])));
        assert!(!is_elemwise_axis(axes.axis(ids[1])));
        assert!(!is_elemwise_axis(axes.axis(ids[2])));
        assert!(Template::Transpose > Template::AllReduce);
    }
}
