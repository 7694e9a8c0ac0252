//! Backend that fabricates code so the control plane can run end to end.
//!
//! The "machine code" is a deterministic byte pattern sized from the byte
//! code. Every statement gets one throw-map entry, and every property the
//! work item snapshotted a shared guard for gets one unique type guard in the
//! transfer package, which is enough to exercise registration, invalidation
//! and cleanup.

use super::{CodeGenOutput, CodegenBackend, WorkItem};
use crate::backend::entry_point::LazyBailOutRecord;
use crate::backend::error::{CodegenError, CodegenResult};
use crate::backend::guards::{PropertyGuard, TypeRef};
use crate::backend::tier::JitTier;
use crate::backend::transfer::{CompilationTransferPackage, TypeGuardTransferEntry};

/// Knobs for [`SyntheticBackend`]
#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    /// Native bytes emitted per byte-code byte at SimpleJit
    pub simple_jit_expansion: usize,
    /// Native bytes emitted per byte-code byte at FullJit
    pub full_jit_expansion: usize,
    /// Emit a unique type guard for every snapshotted shared guard
    pub emit_type_guards: bool,
    /// Register the snapshotted properties for lazy bailout
    pub lazy_bailout: bool,
    /// Byte code longer than this fails with a stack overflow
    pub max_byte_code_len: usize,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        SyntheticOptions {
            simple_jit_expansion: 4,
            full_jit_expansion: 8,
            emit_type_guards: true,
            lazy_bailout: false,
            max_byte_code_len: 1 << 16,
        }
    }
}

/// Deterministic stand-in for a real code generator
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    options: SyntheticOptions,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        SyntheticBackend { options }
    }

    fn expansion(&self, tier: JitTier) -> usize {
        match tier {
            JitTier::SimpleJit => self.options.simple_jit_expansion,
            JitTier::FullJit => self.options.full_jit_expansion,
        }
    }

    /// Type address a guard for `property` is bound to
    fn synthetic_type(item: &WorkItem, property: u32) -> TypeRef {
        TypeRef::new(0x1_0000 + ((property as u64) << 8) + ((item.function.index() as u64) << 4))
    }
}

impl CodegenBackend for SyntheticBackend {
    fn compile(&self, item: &WorkItem) -> CodegenResult<CodeGenOutput> {
        if item.byte_code.len() > self.options.max_byte_code_len {
            return Err(CodegenError::StackOverflow);
        }
        let size = (item.byte_code.len() * self.expansion(item.tier)).max(16);
        let code: Vec<u8> = (0..size)
            .map(|i| item.byte_code.get(i % item.byte_code.len().max(1)).copied().unwrap_or(0xcc) ^ (i as u8))
            .collect();

        let statements = item.statement_count.max(1);
        let stride = (size as u32 / statements).max(1);
        let throw_map = (0..statements).map(|s| (s * stride, s)).collect();

        let mut transfer = CompilationTransferPackage::default();
        if self.options.emit_type_guards {
            for (index, (property, _)) in item.shared_guards.iter().enumerate() {
                let type_ref = Self::synthetic_type(item, property.0);
                transfer.pinned_type_refs.push(type_ref);
                transfer.property_guards.push(TypeGuardTransferEntry {
                    property: *property,
                    guards: vec![PropertyGuard::indexed(*property, type_ref, index as u32)],
                });
            }
        }
        let mut lazy_bailout_records = Vec::new();
        if self.options.lazy_bailout {
            transfer.lazy_bailout_properties = item.shared_guards.iter().map(|(p, _)| *p).collect();
            lazy_bailout_records = (0..statements)
                .map(|s| LazyBailOutRecord {
                    return_offset: s * stride + stride / 2,
                    bailout_offset: size as u32 + s * 8,
                })
                .collect();
        }

        Ok(CodeGenOutput {
            code,
            unwind: vec![0x01, item.tier as u8, statements as u8],
            transfer,
            throw_map,
            lazy_bailout_records,
        })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::arena::test_handle;
    use crate::backend::codegen::JobId;
    use crate::backend::guards::PropertyId;
    use std::sync::Arc;

    fn item(tier: JitTier, len: usize) -> WorkItem {
        WorkItem {
            job: JobId(1),
            entry_point: test_handle(0),
            function: test_handle(3),
            function_name: Arc::from("g"),
            tier,
            loop_number: None,
            byte_code: vec![7u8; len].into(),
            statement_count: 4,
            inline_cache_count: 0,
            shared_guards: vec![(PropertyId(5), PropertyGuard::new(PropertyId(5)))],
        }
    }

    #[test]
    fn test_size_depends_on_tier() {
        let backend = SyntheticBackend::default();
        let simple = backend.compile(&item(JitTier::SimpleJit, 10)).unwrap();
        let full = backend.compile(&item(JitTier::FullJit, 10)).unwrap();
        assert_eq!(simple.code.len(), 40);
        assert_eq!(full.code.len(), 80);
        assert_eq!(full.throw_map.len(), 4);
        assert_eq!(full.throw_map[1], (20, 1));
    }

    #[test]
    fn test_guards_for_snapshotted_properties() {
        let backend = SyntheticBackend::default();
        let output = backend.compile(&item(JitTier::FullJit, 10)).unwrap();
        assert_eq!(output.transfer.unique_guard_count(), 1);
        assert_eq!(output.transfer.pinned_type_refs.len(), 1);
        assert!(output.lazy_bailout_records.is_empty());
    }

    #[test]
    fn test_oversized_byte_code_overflows() {
        let backend = SyntheticBackend::new(SyntheticOptions {
            max_byte_code_len: 4,
            ..Default::default()
        });
        assert_eq!(
            backend.compile(&item(JitTier::FullJit, 10)).err(),
            Some(CodegenError::StackOverflow)
        );
    }
}
