use crate::error::LayoutError;
use dotnetdll::prelude::{ExplicitLayout, Layout, SequentialLayout};
use enum_dispatch::enum_dispatch;
use std::{collections::HashMap, mem::size_of, ops::Range};

const DEFAULT_PACKING: usize = 8;

#[enum_dispatch]
pub trait HasLayout {
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;
}

#[enum_dispatch(HasLayout)]
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutManager {
    FieldLayoutManager,
    Scalar,
}

impl LayoutManager {
    pub fn type_tag(&self) -> &'static str {
        match self {
            LayoutManager::FieldLayoutManager(_) => "struct",
            LayoutManager::Scalar(s) => s.type_tag(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    NativeInt,
    Float32,
    Float64,
}

impl HasLayout for Scalar {
    fn size(&self) -> usize {
        match self {
            Scalar::Int8 | Scalar::UInt8 => 1,
            Scalar::Int16 | Scalar::UInt16 => 2,
            Scalar::Int32 | Scalar::UInt32 | Scalar::Float32 => 4,
            Scalar::Int64 | Scalar::UInt64 | Scalar::Float64 => 8,
            Scalar::NativeInt => size_of::<usize>(),
        }
    }

    fn alignment(&self) -> usize {
        self.size()
    }
}

impl Scalar {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Scalar::Int8 => "i8",
            Scalar::UInt8 => "u8",
            Scalar::Int16 => "i16",
            Scalar::UInt16 => "u16",
            Scalar::Int32 => "i32",
            Scalar::UInt32 => "u32",
            Scalar::Int64 => "i64",
            Scalar::UInt64 => "u64",
            Scalar::NativeInt => "ptr",
            Scalar::Float32 => "f32",
            Scalar::Float64 => "f64",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "i8" => Scalar::Int8,
            "u8" => Scalar::UInt8,
            "i16" => Scalar::Int16,
            "u16" => Scalar::UInt16,
            "i32" => Scalar::Int32,
            "u32" => Scalar::UInt32,
            "i64" => Scalar::Int64,
            "u64" => Scalar::UInt64,
            "ptr" | "isize" | "usize" => Scalar::NativeInt,
            "f32" => Scalar::Float32,
            "f64" => Scalar::Float64,
            _ => return None,
        })
    }
}

pub const fn align_up(value: usize, align: usize) -> usize {
    let misalignment = value % align;
    if misalignment == 0 {
        value
    } else {
        value + align - misalignment
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayout {
    pub position: usize,
    pub layout: LayoutManager,
}

impl FieldLayout {
    pub fn as_range(&self) -> Range<usize> {
        self.position..self.position + self.layout.size()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayoutManager {
    pub fields: HashMap<String, FieldLayout>,
    pub total_size: usize,
    pub alignment: usize,
}

impl HasLayout for FieldLayoutManager {
    fn size(&self) -> usize {
        self.total_size
    }

    fn alignment(&self) -> usize {
        self.alignment
    }
}

impl FieldLayoutManager {
    /// Lays out `fields` (name, explicit offset, layout) in declaration order according to
    /// the metadata layout kind.
    pub fn new<'a>(
        type_name: &str,
        fields: impl IntoIterator<Item = (&'a str, Option<usize>, LayoutManager)>,
        layout: Layout,
    ) -> Result<Self, LayoutError> {
        let mut mapping: HashMap<String, FieldLayout> = HashMap::new();
        let mut max_alignment = 1;
        let total_size;

        let fields: Vec<_> = fields.into_iter().collect();

        let mut insert = |name: &str, position: usize, layout: LayoutManager| {
            if mapping.contains_key(name) {
                return Err(LayoutError::DuplicateField {
                    type_name: type_name.to_string(),
                    field: name.to_string(),
                });
            }
            mapping.insert(name.to_string(), FieldLayout { position, layout });
            Ok(())
        };

        match layout {
            Layout::Automatic => {
                // free to reorder: largest alignment first keeps padding down
                let mut sorted = fields;
                sorted.sort_by_key(|(_, _, l)| std::cmp::Reverse(l.alignment()));

                let mut offset = 0;
                for (name, _, layout) in sorted {
                    let field_align = layout.alignment().max(1);
                    max_alignment = max_alignment.max(field_align);
                    let aligned_offset = align_up(offset, field_align);
                    offset = aligned_offset + layout.size();
                    insert(name, aligned_offset, layout)?;
                }

                total_size = align_up(offset, max_alignment);
            }
            Layout::Sequential(s) => {
                let (packing_size, class_size) = match s {
                    None => (DEFAULT_PACKING, 0),
                    Some(SequentialLayout {
                        packing_size,
                        class_size,
                    }) => (
                        if packing_size == 0 {
                            DEFAULT_PACKING
                        } else {
                            packing_size
                        },
                        class_size,
                    ),
                };

                let mut offset = 0;
                for (name, _, layout) in fields {
                    let field_align = layout.alignment().clamp(1, packing_size);
                    max_alignment = max_alignment.max(field_align);
                    let aligned_offset = align_up(offset, field_align);
                    offset = aligned_offset + layout.size();
                    insert(name, aligned_offset, layout)?;
                }

                total_size = align_up(offset, max_alignment).max(class_size);
            }
            Layout::Explicit(e) => {
                let mut end = 0;
                for (name, offset, layout) in fields {
                    let Some(position) = offset else {
                        return Err(LayoutError::MissingExplicitOffset {
                            type_name: type_name.to_string(),
                            field: name.to_string(),
                        });
                    };
                    max_alignment = max_alignment.max(layout.alignment());
                    end = end.max(position + layout.size());
                    insert(name, position, layout)?;
                }
                total_size = match e {
                    Some(ExplicitLayout { class_size }) => class_size.max(end),
                    None => end,
                };
            }
        }

        Ok(Self {
            fields: mapping,
            total_size,
            alignment: max_alignment,
        })
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.get(name)
    }

    /// Fields ordered by their position in the native buffer.
    pub fn ordered_fields(&self) -> Vec<(&str, &FieldLayout)> {
        let mut fields: Vec<_> = self
            .fields
            .iter()
            .map(|(name, f)| (name.as_str(), f))
            .collect();
        fields.sort_by_key(|(name, f)| (f.position, *name));
        fields
    }
}
